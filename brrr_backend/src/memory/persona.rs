use serde::{Deserialize, Serialize};

/// Canned persona instructions a user can apply instead of writing their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaPreset {
    Concise,
    Detailed,
    Beginner,
    Technical,
    Hype,
    Calm,
}

impl PersonaPreset {
    pub const ALL: [PersonaPreset; 6] = [
        PersonaPreset::Concise,
        PersonaPreset::Detailed,
        PersonaPreset::Beginner,
        PersonaPreset::Technical,
        PersonaPreset::Hype,
        PersonaPreset::Calm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PersonaPreset::Concise => "concise",
            PersonaPreset::Detailed => "detailed",
            PersonaPreset::Beginner => "beginner",
            PersonaPreset::Technical => "technical",
            PersonaPreset::Hype => "hype",
            PersonaPreset::Calm => "calm",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PersonaPreset::Concise => "Concise",
            PersonaPreset::Detailed => "Detailed",
            PersonaPreset::Beginner => "Beginner-Friendly",
            PersonaPreset::Technical => "Technical",
            PersonaPreset::Hype => "Hype",
            PersonaPreset::Calm => "Calm",
        }
    }

    pub fn instructions(self) -> &'static str {
        match self {
            PersonaPreset::Concise => {
                "Keep responses very short and to the point. Avoid unnecessary explanation. \
                 Use bullet points when listing things. Skip pleasantries."
            }
            PersonaPreset::Detailed => {
                "Provide thorough, comprehensive explanations. Include examples when helpful. \
                 Break down complex topics step by step. Don't assume prior knowledge."
            }
            PersonaPreset::Beginner => {
                "Explain things as if I'm new to programming. Use simple analogies. \
                 Define technical terms. Be patient and encouraging. \
                 Suggest resources for learning more."
            }
            PersonaPreset::Technical => {
                "Use precise technical terminology. Assume I have solid programming experience. \
                 Focus on implementation details, edge cases, and best practices. Be direct."
            }
            PersonaPreset::Hype => {
                "Be SUPER enthusiastic! Celebrate every win, big or small. \
                 Make everything feel exciting. Pump me up to ship my projects!"
            }
            PersonaPreset::Calm => {
                "Keep a relaxed, no-pressure tone. Don't be overly energetic. \
                 Be supportive but chill. It's okay to take things slow. \
                 Focus on sustainable progress."
            }
        }
    }

    pub fn from_name(raw: &str) -> Option<Self> {
        let wanted = raw.trim();
        Self::ALL
            .into_iter()
            .find(|preset| preset.name().eq_ignore_ascii_case(wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_names_round_trip_case_insensitively() {
        for preset in PersonaPreset::ALL {
            assert_eq!(PersonaPreset::from_name(preset.name()), Some(preset));
        }
        assert_eq!(PersonaPreset::from_name(" HYPE "), Some(PersonaPreset::Hype));
        assert_eq!(PersonaPreset::from_name("pirate"), None);
    }
}
