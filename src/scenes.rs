/*!
 # Scene table for TG609 lights

 Scenes are preprogrammed patterns selected by a numeric code. Several names
 are listed under both their hyphen and underscore spelling so either form of
 caller input resolves.
*/

/// Scene names and their device codes
pub const SCENES_TG609: &[(&str, u16)] = &[
    ("symphony", 2),
    ("energy", 3),
    ("jump", 4),
    ("vitality", 7),
    ("accumulation", 16),
    ("chase", 23),
    ("space-time", 45),
    ("space_time", 45),
    ("ephemeral", 35),
    ("flow", 55),
    ("forest", 13),
    ("neon_lights", 48),
    ("neon-lights", 48),
    ("green_jade", 71),
    ("green-jade", 71),
    ("running", 91),
    ("pink_light", 109),
    ("pink-light", 109),
    ("alarm", 113),
    ("aurora", 59),
    ("rainbow", 26),
    ("melody", 32),
];

/// Normalizes a scene name: trimmed, lowercased, spaces and hyphens turned into underscores.
///
/// `"Space-Time"`, `"space time"` and `"space_time"` all normalize to `"space_time"`.
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '-'], "_")
}

fn code_of(key: &str) -> Option<u16> {
    SCENES_TG609
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, code)| *code)
}

/// Resolves a scene name to its normalized key and code.
///
/// The underscore spelling is tried first, then the hyphenated one.
pub fn lookup(name: &str) -> Option<(String, u16)> {
    let key = normalize(name);
    let code = code_of(&key).or_else(|| code_of(&key.replace('_', "-")))?;
    Some((key, code))
}

/// Whether `key` is a name in [`SCENES_TG609`], spelled exactly
pub fn is_listed(key: &str) -> bool {
    code_of(key).is_some()
}

/// Every accepted scene name, sorted and deduplicated
pub fn effect_list() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = SCENES_TG609.iter().map(|(name, _)| *name).collect();
    names.sort_unstable();
    names.dedup();
    names
}
