//! §6.3 Voice-resolution configuration.
//!
//! The core never owns a configuration store; it only consumes one through
//! [`VoiceConfigProvider`]. [`TomlVoiceConfig`] is the ambient default this
//! crate ships, generalizing the teacher's own `Config`/`DaemonConfig` TOML
//! pattern (XDG config dir via `dirs`, `toml` (de)serialization) to the
//! two voice-resolution keys of §6.3 instead of daemon settings.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A `(provider_identifier, voice_identifier)` pair, as stored in config.
pub type VoiceRef = (String, String);

/// Consumed by [`crate::resolver::VoiceResolver`]. A config read error must
/// never fail resolution — implementations are expected to fall back to
/// "no default" / "empty mapping" rather than propagate.
pub trait VoiceConfigProvider: Send + Sync {
    fn default_voice(&self) -> Option<VoiceRef>;
    fn language_mapping(&self) -> HashMap<String, VoiceRef>;
}

/// On-disk shape of `config.toml`'s `default-voice` / `language-voice-mapping`
/// keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "default-voice")]
    pub default_voice: Option<VoiceRef>,
    #[serde(rename = "language-voice-mapping")]
    pub language_voice_mapping: HashMap<String, VoiceRef>,
}

/// Reads `Config` from `$XDG_CONFIG_HOME/spiel/config.toml` (or its
/// platform equivalent per the `dirs` crate). Absence or a parse failure is
/// never fatal: [`TomlVoiceConfig::load`] logs a warning and falls back to
/// [`Config::default`].
pub struct TomlVoiceConfig {
    config: Config,
}

impl TomlVoiceConfig {
    pub fn load() -> Self {
        let config = Self::config_path()
            .and_then(|path| {
                if !path.exists() {
                    return None;
                }
                match std::fs::read_to_string(&path) {
                    Ok(content) => match toml::from_str(&content) {
                        Ok(config) => Some(config),
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "could not parse voice config, falling back to defaults");
                            None
                        }
                    },
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "could not read voice config, falling back to defaults");
                        None
                    }
                }
            })
            .unwrap_or_default();

        TomlVoiceConfig { config }
    }

    pub fn config_path() -> Option<PathBuf> {
        crate::paths::config_dir().map(|dir| dir.join("spiel").join("config.toml"))
    }
}

impl VoiceConfigProvider for TomlVoiceConfig {
    fn default_voice(&self) -> Option<VoiceRef> {
        self.config.default_voice.clone()
    }

    fn language_mapping(&self) -> HashMap<String, VoiceRef> {
        self.config.language_voice_mapping.clone()
    }
}

/// An empty [`VoiceConfigProvider`], for hosts that have no configuration
/// store at all — resolution falls straight through to §4.4 rules 4/5.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVoiceConfig;

impl VoiceConfigProvider for NoVoiceConfig {
    fn default_voice(&self) -> Option<VoiceRef> {
        None
    }

    fn language_mapping(&self) -> HashMap<String, VoiceRef> {
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_voice_and_mapping() {
        let toml = r#"
            default-voice = ["org.mock.Speech.Provider", "gmw/en-US"]

            [language-voice-mapping]
            en = ["org.mock.Speech.Provider", "gmw/en-US"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.default_voice,
            Some(("org.mock.Speech.Provider".to_string(), "gmw/en-US".to_string()))
        );
        assert_eq!(config.language_voice_mapping.len(), 1);
    }

    #[test]
    fn missing_keys_default_to_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.default_voice.is_none());
        assert!(config.language_voice_mapping.is_empty());
    }

    #[test]
    fn no_voice_config_is_always_empty() {
        let config = NoVoiceConfig;
        assert!(config.default_voice().is_none());
        assert!(config.language_mapping().is_empty());
    }
}
