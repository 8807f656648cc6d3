//! §4.4 VoiceResolver: picks a voice for an utterance.

use crate::config::VoiceConfigProvider;
use crate::error::SpielError;
use crate::voice::Voice;

/// Resolves a voice for an utterance against the aggregate voice list and
/// a [`VoiceConfigProvider`], per the six-step order in §4.4.
pub struct VoiceResolver;

impl VoiceResolver {
    /// `explicit_voice_id` corresponds to `utterance.voice` already
    /// resolved to a concrete id by the caller (§3's `Utterance::voice`
    /// is `Option<VoiceId>`; this resolver works purely in terms of
    /// identifiers and the aggregate, not the `Utterance` type itself, so
    /// it has no dependency on `crate::speaker`).
    pub fn resolve(
        aggregate: &[Voice],
        config: &dyn VoiceConfigProvider,
        explicit_voice_id: Option<&str>,
        language: Option<&str>,
    ) -> Result<Voice, SpielError> {
        if aggregate.is_empty() {
            return Err(SpielError::NoProvidersAvailable);
        }

        // 1. Explicit voice.
        if let Some(id) = explicit_voice_id {
            if let Some(voice) = find_by_id(aggregate, id) {
                return Ok(voice.clone());
            }
        }

        // 2. Language-mapping lookup, suffix-reducing (case-sensitive, per
        // the Open Question resolved in DESIGN.md).
        if let Some(lang) = language {
            let mapping = config.language_mapping();
            if let Some(voice) = resolve_by_suffix_reduction(lang, &mapping, aggregate) {
                return Ok(voice);
            }
        }

        // 3. Configured default.
        if let Some((provider, voice_id)) = config.default_voice() {
            if let Some(voice) = find_by_provider_and_id(aggregate, &provider, &voice_id) {
                return Ok(voice.clone());
            }
        }

        // 4. Any voice advertising the exact language tag.
        if let Some(lang) = language {
            if let Some(voice) = aggregate.iter().find(|v| v.languages.iter().any(|l| l == lang)) {
                return Ok(voice.clone());
            }
        }

        // 5. First voice in aggregate order.
        Ok(aggregate[0].clone())
    }
}

fn find_by_id<'a>(aggregate: &'a [Voice], id: &str) -> Option<&'a Voice> {
    aggregate.iter().find(|v| v.identifier == id)
}

fn find_by_provider_and_id<'a>(
    aggregate: &'a [Voice],
    provider: &str,
    id: &str,
) -> Option<&'a Voice> {
    aggregate
        .iter()
        .find(|v| v.provider == provider && v.identifier == id)
}

/// Tries `lang`, then repeatedly drops the last `-`-separated segment,
/// until a mapping entry is found (and resolves to a real voice) or the
/// tag is empty.
fn resolve_by_suffix_reduction(
    lang: &str,
    mapping: &std::collections::HashMap<String, (String, String)>,
    aggregate: &[Voice],
) -> Option<Voice> {
    let mut tag = lang;
    loop {
        if let Some((provider, voice_id)) = mapping.get(tag) {
            if let Some(voice) = find_by_provider_and_id(aggregate, provider, voice_id) {
                return Some(voice.clone());
            }
        }
        match tag.rfind('-') {
            Some(idx) => tag = &tag[..idx],
            None => return None,
        }
    }
}
