use crate::types::{Config, ConfirmationConfig};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup checks. These are the only fatal errors of the system.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                bail!("{} must be within [0, 1], got {}", name, v);
            }
            Ok(())
        };

        unit("detection.person_confidence", self.detection.person_confidence)?;
        unit("detection.ppe_confidence", self.detection.ppe_confidence)?;
        unit("identity.face_threshold", self.identity.face_threshold)?;
        unit(
            "identity.appearance_threshold",
            self.identity.appearance_threshold,
        )?;
        unit(
            "association.default_threshold",
            self.association.default_threshold,
        )?;
        for (kind, t) in &self.association.thresholds {
            unit(format!("association.thresholds.{}", kind).as_str(), *t)?;
        }

        if self.identity.face_threshold < self.identity.appearance_threshold {
            bail!(
                "identity.face_threshold ({}) must not be looser than identity.appearance_threshold ({})",
                self.identity.face_threshold,
                self.identity.appearance_threshold
            );
        }

        if self.detection.frame_stride == 0 {
            bail!("detection.frame_stride must be at least 1");
        }

        if let ConfirmationConfig::MajorityVote { votes } = self.identity.confirmation {
            if votes == 0 {
                bail!("identity.confirmation.votes must be at least 1");
            }
        }

        if self.compliance.required.is_empty() {
            bail!("compliance.required must name at least one equipment kind");
        }
        for item in &self.compliance.required {
            if !self.detection.classes.equipment.contains_key(item) {
                bail!(
                    "compliance.required item '{}' is not declared in detection.classes.equipment",
                    item
                );
            }
        }

        if self.detection.classes.person.is_empty() {
            bail!("detection.classes.person must list at least one label");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shipped_config_parses() {
        let config: Config = serde_yaml::from_str(include_str!("../config.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.models.detector.is_none());
        assert_eq!(config.identity.confirmation, ConfirmationConfig::Immediate);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "
identity:
  patience_frames: 10
  confirmation:
    policy: majority_vote
    votes: 5
compliance:
  required: [helmet, vest]
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.identity.patience_frames, 10);
        assert_eq!(
            config.identity.confirmation,
            ConfirmationConfig::MajorityVote { votes: 5 }
        );
        assert!((config.identity.face_threshold - 0.7).abs() < 1e-6);
        assert_eq!(config.compliance.required.len(), 2);
        assert_eq!(config.detection.frame_stride, 3);
    }

    #[test]
    fn test_face_threshold_looser_than_appearance_rejected() {
        let mut config = Config::default();
        config.identity.face_threshold = 0.5;
        config.identity.appearance_threshold = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_required_item_rejected() {
        let mut config = Config::default();
        config.compliance.required.push("harness".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_stride_rejected() {
        let mut config = Config::default();
        config.detection.frame_stride = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut config = Config::default();
        config
            .association
            .thresholds
            .insert("vest".to_string(), 1.5);
        assert!(config.validate().is_err());
    }
}
