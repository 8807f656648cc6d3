//! The [`Voice`] value type and its `output_format` media-type parsing.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::error::{ProviderId, VoiceId};

/// The two `output_format` top-level media types this crate knows how to
/// route. Anything else is carried as `Other` and causes a
/// [`crate::error::SpielError::MisconfiguredVoice`] once a [`Voice`]
/// carrying it is actually spoken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    /// `audio/x-raw` — a pure PCM stream, no framing.
    Raw,
    /// `audio/x-spiel` — the framed audio+events stream of §6.2.
    Spiel,
    Other(String),
}

/// A parsed `output_format` media-type string, e.g.
/// `audio/x-raw;format=S16LE,channels=1,rate=22050`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFormat {
    pub kind: MediaKind,
    pub format: Option<String>,
    pub channels: Option<u32>,
    pub rate: Option<u32>,
}

impl OutputFormat {
    /// Parses a media-type string. Unknown top-level types and unparsable
    /// parameters are preserved rather than rejected here — whether a
    /// format is usable is a property checked at synthesis time, not parse
    /// time (a provider may legitimately advertise `audio/x-spiel` with no
    /// `rate` parameter if the framed stream self-describes it elsewhere).
    pub fn parse(media_type: &str) -> Self {
        let mut parts = media_type.split(';');
        let top_level = parts.next().unwrap_or_default().trim();

        let kind = match top_level {
            "audio/x-raw" => MediaKind::Raw,
            "audio/x-spiel" => MediaKind::Spiel,
            other => MediaKind::Other(other.to_string()),
        };

        let mut params: HashMap<String, String> = HashMap::new();
        for part in parts {
            for kv in part.split(',') {
                if let Some((key, value)) = kv.split_once('=') {
                    params.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }

        OutputFormat {
            kind,
            format: params.remove("format"),
            channels: params.remove("channels").and_then(|v| v.parse().ok()),
            rate: params.remove("rate").and_then(|v| v.parse().ok()),
        }
    }

    /// Whether this format can be routed by the playback pipeline at all.
    pub fn is_usable(&self) -> bool {
        !matches!(self.kind, MediaKind::Other(_))
    }
}

/// A 32-bit feature flag set. Providers advertise features as a 64-bit
/// value over D-Bus; only the low 32 bits are meaningful here, and the
/// high bits are dropped with a one-time warning per voice (see
/// [`Voice::from_advertised`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoiceFeatures(pub u32);

impl VoiceFeatures {
    pub fn truncate(raw: u64) -> (Self, bool) {
        let truncated = raw as u32;
        let lost_bits = raw >> 32 != 0;
        (VoiceFeatures(truncated), lost_bits)
    }
}

/// One synthesis profile offered by a provider.
///
/// `provider` is a *weak* back-reference: just the provider's bus-name
/// identifier, never a handle that could keep a dead [`crate::provider::Provider`]
/// alive. Resolving the live provider goes back through the
/// [`crate::registry::ProviderRegistry`] by identifier.
#[derive(Debug, Clone)]
pub struct Voice {
    pub name: String,
    pub identifier: VoiceId,
    pub languages: Vec<String>,
    pub features: VoiceFeatures,
    pub output_format: OutputFormat,
    pub provider: ProviderId,
}

impl Voice {
    pub fn new(
        name: impl Into<String>,
        identifier: impl Into<VoiceId>,
        languages: Vec<String>,
        features_raw: u64,
        output_format: &str,
        provider: impl Into<ProviderId>,
    ) -> (Self, bool) {
        let (features, lost_bits) = VoiceFeatures::truncate(features_raw);
        let voice = Voice {
            name: name.into(),
            identifier: identifier.into(),
            languages,
            features,
            output_format: OutputFormat::parse(output_format),
            provider: provider.into(),
        };
        (voice, lost_bits)
    }

    /// The four-tuple equality/hash/order is keyed on, per §3: the
    /// `output_format` is deliberately excluded.
    fn key(&self) -> (&str, &str, &str, &[String]) {
        (&self.provider, &self.name, &self.identifier, &self.languages)
    }
}

impl PartialEq for Voice {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Voice {}

impl Hash for Voice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Voice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Voice {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(provider: &str, name: &str, id: &str, langs: &[&str]) -> Voice {
        Voice::new(
            name,
            id,
            langs.iter().map(|s| s.to_string()).collect(),
            0,
            "audio/x-raw;format=S16LE,channels=1,rate=22050",
            provider,
        )
        .0
    }

    #[test]
    fn parses_raw_format_params() {
        let fmt = OutputFormat::parse("audio/x-raw;format=S16LE,channels=1,rate=22050");
        assert_eq!(fmt.kind, MediaKind::Raw);
        assert_eq!(fmt.format.as_deref(), Some("S16LE"));
        assert_eq!(fmt.channels, Some(1));
        assert_eq!(fmt.rate, Some(22050));
        assert!(fmt.is_usable());
    }

    #[test]
    fn parses_spiel_format() {
        let fmt = OutputFormat::parse("audio/x-spiel;format=S16LE,channels=2,rate=48000");
        assert_eq!(fmt.kind, MediaKind::Spiel);
        assert!(fmt.is_usable());
    }

    #[test]
    fn unknown_top_level_type_is_unusable() {
        let fmt = OutputFormat::parse("audio/x-opus;rate=48000");
        assert!(matches!(fmt.kind, MediaKind::Other(_)));
        assert!(!fmt.is_usable());
    }

    #[test]
    fn equality_ignores_output_format() {
        let a = voice("org.a.Speech.Provider", "Voice", "id1", &["en"]);
        let mut b = a.clone();
        b.output_format = OutputFormat::parse("audio/x-spiel;rate=48000");
        assert_eq!(a, b);
    }

    #[test]
    fn equality_is_reflexive_symmetric_transitive() {
        let a = voice("p", "n", "i", &["en"]);
        let b = voice("p", "n", "i", &["en"]);
        let c = voice("p", "n", "i", &["en"]);
        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(b, c);
        assert_eq!(a, c);
    }

    #[test]
    fn same_tuple_different_provider_is_unequal() {
        let a = voice("org.a.Speech.Provider", "Voice", "id1", &["en"]);
        let b = voice("org.b.Speech.Provider", "Voice", "id1", &["en"]);
        assert_ne!(a, b);
    }

    #[test]
    fn equal_voices_hash_equal() {
        use std::collections::hash_map::DefaultHasher;
        let a = voice("p", "n", "i", &["en"]);
        let b = voice("p", "n", "i", &["en"]);
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn ordering_is_by_provider_then_name_then_id_then_languages() {
        let a = voice("org.a.Speech.Provider", "A", "1", &["en"]);
        let b = voice("org.b.Speech.Provider", "A", "1", &["en"]);
        assert!(a < b);
    }

    #[test]
    fn features_truncate_high_bits_and_report_loss() {
        let (features, lost) = VoiceFeatures::truncate(0x1_0000_0001);
        assert_eq!(features.0, 1);
        assert!(lost);

        let (features, lost) = VoiceFeatures::truncate(0x2A);
        assert_eq!(features.0, 0x2A);
        assert!(!lost);
    }
}
