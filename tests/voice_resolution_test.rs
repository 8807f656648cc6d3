//! Integration test: voice resolution scenarios from the end-to-end
//! properties, driven entirely through public API types (no bus needed,
//! since resolution only ever touches an aggregate `Vec<Voice>` and a
//! `VoiceConfigProvider`).

use std::collections::HashMap;

use spiel_orchestrator::{NoVoiceConfig, SpielError, Voice, VoiceConfigProvider, VoiceRef, VoiceResolver};

fn raw_voice(provider: &str, id: &str, langs: &[&str]) -> Voice {
    Voice::new(
        id,
        id,
        langs.iter().map(|s| s.to_string()).collect(),
        0,
        "audio/x-raw;format=S16LE,channels=1,rate=22050",
        provider,
    )
    .0
}

struct FixedConfig {
    default_voice: Option<VoiceRef>,
    language_mapping: HashMap<String, VoiceRef>,
}

impl VoiceConfigProvider for FixedConfig {
    fn default_voice(&self) -> Option<VoiceRef> {
        self.default_voice.clone()
    }

    fn language_mapping(&self) -> HashMap<String, VoiceRef> {
        self.language_mapping.clone()
    }
}

#[test]
fn scenario_3_language_fallback_with_no_configuration() {
    let a1 = raw_voice("org.a.Speech.Provider", "A1", &["fr"]);
    let b1 = raw_voice("org.b.Speech.Provider", "B1", &["en-us", "en"]);
    let aggregate = vec![a1, b1.clone()];

    let resolved = VoiceResolver::resolve(&aggregate, &NoVoiceConfig, None, Some("en")).unwrap();
    assert_eq!(resolved, b1);
}

#[test]
fn scenario_4_language_mapping_with_suffix_reduction() {
    let b1 = raw_voice("org.b.Speech.Provider", "B1", &["en"]);
    let aggregate = vec![b1.clone()];

    let mut language_mapping = HashMap::new();
    language_mapping.insert(
        "en".to_string(),
        ("org.b.Speech.Provider".to_string(), "B1".to_string()),
    );
    let config = FixedConfig {
        default_voice: None,
        language_mapping,
    };

    let resolved =
        VoiceResolver::resolve(&aggregate, &config, None, Some("en-GB")).unwrap();
    assert_eq!(resolved, b1);
}

#[test]
fn empty_aggregate_is_reported_as_no_providers_available() {
    let result = VoiceResolver::resolve(&[], &NoVoiceConfig, None, None);
    assert!(matches!(result, Err(SpielError::NoProvidersAvailable)));
}

#[test]
fn aggregate_ordering_law_holds_across_providers() {
    let mut aggregate = vec![
        raw_voice("org.b.Speech.Provider", "B1", &["en"]),
        raw_voice("org.a.Speech.Provider", "A1", &["en"]),
    ];
    aggregate.sort();

    assert_eq!(aggregate[0].provider, "org.a.Speech.Provider");
    assert_eq!(aggregate[1].provider, "org.b.Speech.Provider");
}

#[test]
fn dangling_default_voice_reference_falls_through_to_first_in_order() {
    let only = raw_voice("org.a.Speech.Provider", "A1", &["en"]);
    let aggregate = vec![only.clone()];
    let config = FixedConfig {
        default_voice: Some(("org.a.Speech.Provider".to_string(), "nonexistent".to_string())),
        language_mapping: HashMap::new(),
    };

    let resolved = VoiceResolver::resolve(&aggregate, &config, None, None).unwrap();
    assert_eq!(resolved, only);
}
