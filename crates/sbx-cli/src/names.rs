//! `<adjective>-<animal>` sandbox names.

use rand::seq::IndexedRandom;

const ADJECTIVES: &[&str] = &[
    "agile", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "daring", "eager",
    "fancy", "fierce", "gentle", "happy", "hardy", "jolly", "keen", "lively", "lucky", "mellow",
    "nimble", "noble", "plucky", "proud", "quick", "quiet", "rapid", "shiny", "silent", "sleek",
    "snappy", "steady", "sunny", "swift", "tidy", "vivid", "warm", "wise", "witty", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "cobra", "condor", "coyote", "crane", "dingo", "dolphin", "eagle",
    "falcon", "ferret", "gecko", "heron", "ibex", "jaguar", "koala", "lemur", "lynx", "marten",
    "moose", "narwhal", "ocelot", "orca", "otter", "panda", "puffin", "quokka", "raven", "salmon",
    "seal", "sparrow", "tapir", "tiger", "toucan", "walrus", "weasel", "wolf", "yak", "zebra",
];

pub fn generate() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("swift");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("tiger");
    format!("{adjective}-{animal}")
}

/// Generate a name `taken` rejects, falling back to a numeric suffix.
pub fn generate_unique(taken: impl Fn(&str) -> bool) -> String {
    for _ in 0..32 {
        let name = generate();
        if !taken(&name) {
            return name;
        }
    }
    let base = generate();
    let mut n = 2;
    loop {
        let name = format!("{base}-{n}");
        if !taken(&name) {
            return name;
        }
        n += 1;
    }
}

/// Sandbox names double as VM hostnames: letters, digits and inner
/// hyphens, at most 63 characters.
pub fn validate(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}
