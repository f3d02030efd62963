//! Request derivation - which assets a payload asks for.
//!
//! Title and prompt are lower-cased and searched for each keyword as a plain
//! substring, so `spritesheet` hits `sprite` and `guide` hits `ui`. Every
//! category with a hit yields one request; no hit at all yields a single
//! `general` request.

use crate::domain::{AssetKind, AssetRequest, Payload};
use crate::error::PipelineError;

const CATEGORIES: [(AssetKind, &[&str]); 4] = [
    (AssetKind::Character, &["sprite", "character", "player", "snake"]),
    (AssetKind::Background, &["background", "scene", "environment", "map"]),
    (AssetKind::Ui, &["ui", "button", "menu", "interface", "hud"]),
    (AssetKind::Icon, &["icon", "item", "powerup", "food", "pickup"]),
];

/// Most requests a single payload can yield.
pub const MAX_REQUESTS: usize = CATEGORIES.len();

pub fn derive_requests(payload: &Payload, style: &str) -> Result<Vec<AssetRequest>, PipelineError> {
    let prompt = payload.prompt.trim();
    if prompt.is_empty() {
        return Err(PipelineError::Derivation("payload prompt is empty".into()));
    }
    let title = payload.title.trim();

    // Searched separately so a keyword never straddles title and prompt.
    let lowered_title = title.to_lowercase();
    let lowered_prompt = prompt.to_lowercase();
    let hit = |keyword: &str| lowered_prompt.contains(keyword) || lowered_title.contains(keyword);

    let mut requests: Vec<AssetRequest> = CATEGORIES
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| hit(k)))
        .map(|(kind, _)| build(*kind, style, title, prompt))
        .collect();
    if requests.is_empty() {
        requests.push(build(AssetKind::General, style, title, prompt));
    }
    Ok(requests)
}

fn build(kind: AssetKind, style: &str, title: &str, prompt: &str) -> AssetRequest {
    let (prompt, description) = match kind {
        AssetKind::Character => (
            format!("{style} game character sprite, {prompt}, clean background, game asset"),
            format!("Character sprite for {title}"),
        ),
        AssetKind::Background => (
            format!("{style} game background, {prompt}, tileable, game environment"),
            format!("Background for {title}"),
        ),
        AssetKind::Ui => (
            format!("{style} game UI element, {prompt}, clean design, user interface"),
            format!("UI element for {title}"),
        ),
        AssetKind::Icon => (
            format!("{style} game icon, {prompt}, small item, game asset"),
            format!("Game icon for {title}"),
        ),
        AssetKind::General => (
            format!("{style} game asset, {prompt}, video game art"),
            format!("Game asset for {title}"),
        ),
    };
    AssetRequest {
        kind,
        prompt,
        description,
        size: kind.target_size(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetSize;
    use rstest::rstest;

    #[test]
    fn snake_sprite_yields_one_character_request() {
        let payload = Payload::new("Snake Sprite", "green pixel-art snake");
        let requests = derive_requests(&payload, "pixel-art").unwrap();

        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.kind, AssetKind::Character);
        assert_eq!(req.size, TargetSize::new(64, 64));
        assert_eq!(req.description, "Character sprite for Snake Sprite");
        assert_eq!(
            req.prompt,
            "pixel-art game character sprite, green pixel-art snake, clean background, game asset"
        );
    }

    #[rstest]
    #[case("Main menu", "buttons and a hud", AssetKind::Ui)]
    #[case("Level", "forest scene", AssetKind::Background)]
    #[case("Pickups", "shiny coins", AssetKind::Icon)]
    #[case("Music", "chiptune loop", AssetKind::General)]
    fn keyword_selects_category(#[case] title: &str, #[case] prompt: &str, #[case] kind: AssetKind) {
        let requests = derive_requests(&Payload::new(title, prompt), "pixel-art").unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, kind);
        assert_eq!(requests[0].size, kind.target_size());
    }

    #[rstest]
    #[case("Guide", "list of things", AssetKind::Ui)]
    #[case("Hero", "a spritesheet", AssetKind::Character)]
    #[case("Tiles", "one bitmap", AssetKind::Background)]
    #[case("CHARACTERS'", "a lineup", AssetKind::Character)]
    fn keywords_match_inside_words(#[case] title: &str, #[case] prompt: &str, #[case] kind: AssetKind) {
        let requests = derive_requests(&Payload::new(title, prompt), "flat").unwrap();
        let kinds: Vec<_> = requests.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, [kind]);
    }

    #[test]
    fn keyword_split_across_title_and_prompt_does_not_count() {
        // "snak" + "e ..." must not read as "snake".
        let requests = derive_requests(&Payload::new("snak", "e tail"), "flat").unwrap();
        assert_eq!(requests[0].kind, AssetKind::General);
    }

    #[test]
    fn several_categories_in_fixed_order() {
        let payload = Payload::new("Snake game", "snake eats food on a map, score menu");
        let kinds: Vec<_> = derive_requests(&payload, "pixel-art")
            .unwrap()
            .into_iter()
            .map(|r| r.kind)
            .collect();
        assert_eq!(
            kinds,
            [
                AssetKind::Character,
                AssetKind::Background,
                AssetKind::Ui,
                AssetKind::Icon
            ]
        );
    }

    #[test]
    fn blank_prompt_is_a_derivation_error() {
        let err = derive_requests(&Payload::new("Snake", "  "), "pixel-art").unwrap_err();
        assert!(matches!(err, PipelineError::Derivation(_)));
    }
}
