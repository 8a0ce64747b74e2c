//! Persona → voice profile registry.
//!
//! Lookups never fail: unknown persona ids resolve to the designated
//! fallback profile, so a session is always configured with a real voice.

use std::collections::HashMap;

/// A named conversational identity with its synthesized voice.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceProfile {
    pub persona_id: String,
    /// Voice id understood by the remote service (e.g. "alloy")
    pub voice: String,
    /// System instructions sent with every session.update
    pub instructions: String,
    /// Short line used for voice previews and as the greeting
    pub sample: Option<String>,
}

impl VoiceProfile {
    pub fn new(
        persona_id: impl Into<String>,
        voice: impl Into<String>,
        instructions: impl Into<String>,
        sample: Option<String>,
    ) -> Self {
        Self {
            persona_id: persona_id.into(),
            voice: voice.into(),
            instructions: instructions.into(),
            sample,
        }
    }
}

/// Built-in personas shipped with the client.
pub fn default_profiles() -> Vec<VoiceProfile> {
    vec![
        VoiceProfile::new(
            "HR",
            "alloy",
            "You are Sarah Chen, HR Director at Venture Builder AI. \
             Speak in a warm, professional tone. Keep responses conversational and helpful. \
             Be empathetic and supportive in your interactions.",
            Some("Welcome to Venture Builder AI! How can I help you today?".to_string()),
        ),
        VoiceProfile::new(
            "CEO",
            "echo",
            "You are Alex Rivera, CEO of Venture Builder AI. \
             Speak with authority, vision, and a touch of inspiration. \
             Be confident and forward-thinking in your responses.",
            Some("I'm Alex Rivera, CEO. Let's build the future together!".to_string()),
        ),
        VoiceProfile::new(
            "Engineer",
            "fable",
            "You are Maya Patel, Lead Engineer at Venture Builder AI. \
             Speak with technical expertise and enthusiasm. Be precise and helpful with technical questions. \
             Show passion for innovation and problem-solving.",
            Some("Hi! I'm Maya, your technical lead. What can I help you build today?".to_string()),
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct VoiceRegistry {
    profiles: HashMap<String, VoiceProfile>,
    fallback: String,
}

impl VoiceRegistry {
    /// Build a registry. If `fallback` is not among `profiles` the first
    /// profile becomes the fallback; an empty list gets a generic profile.
    pub fn new(profiles: Vec<VoiceProfile>, fallback: &str) -> Self {
        let mut fallback = fallback.to_string();
        let mut map: HashMap<String, VoiceProfile> = HashMap::new();
        let first = profiles.first().map(|p| p.persona_id.clone());
        for profile in profiles {
            map.insert(profile.persona_id.clone(), profile);
        }

        if !map.contains_key(&fallback) {
            match first {
                Some(id) => {
                    log::warn!("Fallback persona '{}' not registered, using '{}'", fallback, id);
                    fallback = id;
                }
                None => {
                    log::warn!("No personas configured, registering a generic '{}' profile", fallback);
                    map.insert(
                        fallback.clone(),
                        VoiceProfile::new(fallback.clone(), "alloy", "You are a helpful assistant.", None),
                    );
                }
            }
        }

        Self { profiles: map, fallback }
    }

    pub fn get(&self, persona_id: &str) -> Option<&VoiceProfile> {
        self.profiles.get(persona_id)
    }

    pub fn is_known(&self, persona_id: &str) -> bool {
        self.profiles.contains_key(persona_id)
    }

    /// Profile for `persona_id`, or the fallback profile for unknown ids.
    pub fn resolve(&self, persona_id: &str) -> &VoiceProfile {
        match self.profiles.get(persona_id) {
            Some(profile) => profile,
            None => {
                log::warn!(
                    "Unknown persona '{}', falling back to '{}'",
                    persona_id,
                    self.fallback
                );
                &self.profiles[&self.fallback]
            }
        }
    }

    pub fn fallback_id(&self) -> &str {
        &self.fallback
    }

    /// Insert or replace a profile.
    pub fn set(&mut self, profile: VoiceProfile) {
        log::info!("Updated voice config for {}: {}", profile.persona_id, profile.voice);
        self.profiles.insert(profile.persona_id.clone(), profile);
    }

    pub fn persona_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Reply shown when the voice service is unreachable, so a typed message
/// never goes unanswered.
pub fn fallback_reply(profile: &VoiceProfile, user_message: &str) -> String {
    match profile.persona_id.as_str() {
        "HR" => format!(
            "Hi! I'm Sarah from HR. You said: '{}'. I'd be happy to help you with any questions \
             about our company policies, benefits, or workplace culture. What would you like to know?",
            user_message
        ),
        "CEO" => format!(
            "Hello! I'm Alex, the CEO. You mentioned: '{}'. I'm here to discuss our company's vision, \
             strategy, or any other business matters. How can I assist you today?",
            user_message
        ),
        "Engineer" => format!(
            "Hey, Maya here. You asked: '{}'. I can't reach the voice service right now, \
             but tell me more about what you're building.",
            user_message
        ),
        _ => format!(
            "Thanks for your message: '{}'. I'm here to help! What would you like to discuss?",
            user_message
        ),
    }
}

impl Default for VoiceRegistry {
    fn default() -> Self {
        Self::new(default_profiles(), "HR")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_persona_resolves_to_fallback() {
        let registry = VoiceRegistry::default();
        let profile = registry.resolve("Janitor");
        assert_eq!(profile.persona_id, "HR");
        assert_eq!(profile.voice, "alloy");
        assert!(!registry.is_known("Janitor"));
    }

    #[test]
    fn known_persona_resolves_to_itself() {
        let registry = VoiceRegistry::default();
        assert_eq!(registry.resolve("CEO").voice, "echo");
        assert_eq!(registry.resolve("Engineer").voice, "fable");
    }

    #[test]
    fn set_replaces_profile() {
        let mut registry = VoiceRegistry::default();
        registry.set(VoiceProfile::new("CEO", "shimmer", "Be brief.", None));
        let profile = registry.get("CEO").unwrap();
        assert_eq!(profile.voice, "shimmer");
        assert_eq!(profile.instructions, "Be brief.");
        assert_eq!(profile.sample, None);
    }

    #[test]
    fn missing_fallback_uses_first_profile() {
        let registry = VoiceRegistry::new(
            vec![VoiceProfile::new("Guard", "onyx", "Stand guard.", None)],
            "HR",
        );
        assert_eq!(registry.fallback_id(), "Guard");
        assert_eq!(registry.resolve("anyone").voice, "onyx");
    }

    #[test]
    fn fallback_reply_quotes_the_message() {
        let registry = VoiceRegistry::default();
        let reply = fallback_reply(registry.resolve("CEO"), "What's next?");
        assert!(reply.contains("'What's next?'"));
        assert!(reply.contains("CEO"));

        let guard = VoiceProfile::new("Guard", "onyx", "Stand guard.", None);
        assert!(fallback_reply(&guard, "hi").starts_with("Thanks for your message: 'hi'"));
    }

    #[test]
    fn empty_registry_gets_generic_fallback() {
        let registry = VoiceRegistry::new(Vec::new(), "HR");
        assert!(registry.is_known("HR"));
        assert_eq!(registry.persona_ids(), vec!["HR".to_string()]);
    }
}
