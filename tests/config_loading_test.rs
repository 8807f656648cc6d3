//! Integration test: `TomlVoiceConfig` reading a real file from a real XDG
//! config directory, then feeding straight into `VoiceResolver` — the §6.3
//! config path end to end. A single test function, since it mutates the
//! process-wide `XDG_CONFIG_HOME` env var and cargo runs tests in a binary
//! concurrently by default.

use spiel_orchestrator::{TomlVoiceConfig, Voice, VoiceConfigProvider, VoiceResolver};

#[test]
fn toml_config_round_trips_into_voice_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("spiel");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        r#"
            default-voice = ["org.mock.Speech.Provider", "gmw/en-US"]

            [language-voice-mapping]
            fr = ["org.mock.Speech.Provider", "gmw/fr-FR"]
        "#,
    )
    .unwrap();

    // SAFETY: this process does not read XDG_CONFIG_HOME anywhere else
    // concurrently with this single-test binary.
    std::env::set_var("XDG_CONFIG_HOME", dir.path());
    let config = TomlVoiceConfig::load();
    std::env::remove_var("XDG_CONFIG_HOME");

    assert_eq!(
        config.default_voice(),
        Some(("org.mock.Speech.Provider".to_string(), "gmw/en-US".to_string()))
    );

    let default_voice = Voice::new(
        "US English",
        "gmw/en-US",
        vec!["en-us".to_string(), "en".to_string()],
        0,
        "audio/x-raw;format=S16LE,channels=1,rate=22050",
        "org.mock.Speech.Provider",
    )
    .0;
    let french_voice = Voice::new(
        "French",
        "gmw/fr-FR",
        vec!["fr".to_string()],
        0,
        "audio/x-raw;format=S16LE,channels=1,rate=22050",
        "org.mock.Speech.Provider",
    )
    .0;
    let aggregate = vec![default_voice.clone(), french_voice.clone()];

    // No explicit voice, no language: falls to the configured default.
    let resolved = VoiceResolver::resolve(&aggregate, &config, None, None).unwrap();
    assert_eq!(resolved, default_voice);

    // Language mapping takes priority over the configured default.
    let resolved = VoiceResolver::resolve(&aggregate, &config, None, Some("fr-CA")).unwrap();
    assert_eq!(resolved, french_voice);
}
