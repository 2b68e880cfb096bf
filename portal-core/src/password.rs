//! Transfer passwords.
//!
//! Format: 3 to 8 hyphen-separated segments of `[a-z0-9]`, each at most 32
//! characters. Generated passwords look like `42-tiger-lamp-orbit`.
//!
//! The first segment is the channel id. For generated passwords the
//! rendezvous server assigns it, so two live senders never share one. The
//! server pairs the two peers on a SHA-256 hash of it and never sees the rest. The full password is
//! only ever fed to the PAKE, so a receiver with the right channel id but the
//! wrong words still pairs and then fails authentication.

use rand::Rng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::ProtocolError;

const MIN_SEGMENTS: usize = 3;
const MAX_SEGMENTS: usize = 8;
const MAX_SEGMENT_LEN: usize = 32;
const GENERATED_WORDS: usize = 3;

const WORDS: &[&str] = &[
    "acorn", "amber", "anchor", "apple", "arrow", "aspen", "atlas", "badge", "bamboo", "basil",
    "beacon", "birch", "bison", "blaze", "bloom", "bolt", "brook", "cabin", "cactus", "canal",
    "canyon", "cedar", "chalk", "cider", "cliff", "clover", "cobalt", "comet", "coral", "crane",
    "crater", "delta", "denim", "dune", "eagle", "ember", "falcon", "fern", "fjord", "flint",
    "forest", "fossil", "garnet", "geyser", "glacier", "granite", "harbor", "hazel", "heron",
    "indigo", "island", "ivory", "jade", "jasper", "juniper", "kayak", "kettle", "lagoon", "lamp",
    "lantern", "lava", "lemon", "lilac", "lotus", "lynx", "maple", "marble", "meadow", "mesa",
    "meteor", "mint", "moss", "nectar", "nickel", "oasis", "ocean", "olive", "onyx", "orbit",
    "orchid", "otter", "pebble", "pepper", "pine", "planet", "plum", "prairie", "quartz", "quill",
    "raven", "reef", "ridge", "river", "robin", "saffron", "sage", "sierra", "slate", "spruce",
    "summit", "sundial", "thistle", "thunder", "tiger", "timber", "topaz", "tulip", "tundra",
    "valley", "velvet", "violet", "walnut", "willow", "zephyr",
];

/// A validated transfer password. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(Zeroizing<String>);

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(..)")
    }
}

impl Password {
    /// Generate a fresh human-presentable password on `channel`.
    pub fn generate(channel: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut parts = Vec::with_capacity(GENERATED_WORDS + 1);
        parts.push(channel.to_string());
        for _ in 0..GENERATED_WORDS {
            parts.push(WORDS[rng.gen_range(0..WORDS.len())].to_string());
        }
        Self(Zeroizing::new(parts.join("-")))
    }

    /// Validate a user-supplied password.
    ///
    /// Surrounding whitespace is trimmed and letters are lowercased before
    /// validation, nothing else is normalised.
    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let normalised = Zeroizing::new(input.trim().to_ascii_lowercase());

        let segments: Vec<&str> = normalised.split('-').collect();
        if segments.len() < MIN_SEGMENTS {
            return Err(ProtocolError::InvalidPassword("too few segments"));
        }
        if segments.len() > MAX_SEGMENTS {
            return Err(ProtocolError::InvalidPassword("too many segments"));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(ProtocolError::InvalidPassword("empty segment"));
            }
            if segment.len() > MAX_SEGMENT_LEN {
                return Err(ProtocolError::InvalidPassword("segment too long"));
            }
            if !segment.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
                return Err(ProtocolError::InvalidPassword("invalid character"));
            }
        }

        Ok(Self(normalised))
    }

    /// The password text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel id: the first segment.
    pub fn channel(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    /// Hex SHA-256 of the channel id, used by the rendezvous server for pairing.
    pub fn channel_hash(&self) -> String {
        hash_channel(self.channel())
    }
}

/// Hex SHA-256 of a channel id.
pub fn hash_channel(channel: &str) -> String {
    hex::encode(Sha256::digest(channel.as_bytes()))
}
