//! Declarative link-quality constraint groups.
//!
//! A constraint group rides on a topology connection and describes the
//! impairments to realise on the resulting interface: propagation delay,
//! jitter, random loss (each with an optional correlation percentage) and a
//! token-bucket rate limit.

use serde::{Deserialize, Serialize};

use crate::number::Number64;

/// Jitter correlation applied when the group sets `jitter` without an
/// explicit `jitter-correlation`, in percent.
pub const DEFAULT_JITTER_CORRELATION: u64 = 10;

/// Loss correlation applied when the group sets `loss` without an explicit
/// `loss-correlation`, in percent.
pub const DEFAULT_LOSS_CORRELATION: u64 = 25;

/// Default token-bucket queue limit, in bytes (one ethernet frame).
pub const DEFAULT_RATE_LIMIT: u64 = 1518;

/// Default token-bucket burst, in bytes (two ethernet frames).
pub const DEFAULT_RATE_BURST: u64 = 2 * 1518;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintError {
    #[error("jitter requires delay")]
    JitterWithoutDelay,
    #[error("jitter-correlation requires jitter")]
    JitterCorrelationWithoutJitter,
    #[error("loss-correlation requires loss")]
    LossCorrelationWithoutLoss,
}

/// Link-quality settings for one interface endpoint.
///
/// Delay and jitter are in microseconds; loss and the correlations are
/// percentages; rates are in bits per second. All fields accept the suffixed
/// number grammar of [`Number64`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Number64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Number64>,

    #[serde(rename = "jitter-correlation", default, skip_serializing_if = "Option::is_none")]
    pub jitter_correlation: Option<Number64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<Number64>,

    #[serde(rename = "loss-correlation", default, skip_serializing_if = "Option::is_none")]
    pub loss_correlation: Option<Number64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<RateLimit>,
}

/// A rate limit, either a bare number or a group with queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateLimit {
    Scalar(Number64),
    Detailed {
        rate: Number64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<Number64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        burst: Option<Number64>,
    },
}

impl RateLimit {
    /// Rate in bits per second.
    pub fn rate(&self) -> u64 {
        match self {
            RateLimit::Scalar(rate) => rate.get(),
            RateLimit::Detailed { rate, .. } => rate.get(),
        }
    }

    /// Queue limit in bytes.
    pub fn limit(&self) -> u64 {
        match self {
            RateLimit::Scalar(_) => DEFAULT_RATE_LIMIT,
            RateLimit::Detailed { limit, .. } => {
                limit.map(Number64::get).unwrap_or(DEFAULT_RATE_LIMIT)
            }
        }
    }

    /// Burst size in bytes.
    pub fn burst(&self) -> u64 {
        match self {
            RateLimit::Scalar(_) => DEFAULT_RATE_BURST,
            RateLimit::Detailed { burst, .. } => {
                burst.map(Number64::get).unwrap_or(DEFAULT_RATE_BURST)
            }
        }
    }
}

impl LinkConstraints {
    /// Whether the group requests no impairment at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether any netem parameter (delay, jitter, loss) is set.
    pub fn has_emulation(&self) -> bool {
        self.delay.is_some() || self.jitter.is_some() || self.loss.is_some()
    }

    /// Check the cross-field dependencies the schema requires.
    pub fn validate(&self) -> Result<(), ConstraintError> {
        if self.jitter.is_some() && self.delay.is_none() {
            return Err(ConstraintError::JitterWithoutDelay);
        }
        if self.jitter_correlation.is_some() && self.jitter.is_none() {
            return Err(ConstraintError::JitterCorrelationWithoutJitter);
        }
        if self.loss_correlation.is_some() && self.loss.is_none() {
            return Err(ConstraintError::LossCorrelationWithoutLoss);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_is_empty() {
        let constraints = LinkConstraints::default();
        assert!(constraints.is_empty());
        assert!(constraints.validate().is_ok());
    }

    #[test]
    fn jitter_requires_delay() {
        let constraints =
            LinkConstraints { jitter: Some(Number64::new(100)), ..Default::default() };
        assert_eq!(constraints.validate(), Err(ConstraintError::JitterWithoutDelay));
    }

    #[test]
    fn correlations_require_their_base_field() {
        let constraints = LinkConstraints {
            jitter_correlation: Some(Number64::new(5)),
            ..Default::default()
        };
        assert_eq!(constraints.validate(), Err(ConstraintError::JitterCorrelationWithoutJitter));

        let constraints = LinkConstraints {
            loss_correlation: Some(Number64::new(5)),
            ..Default::default()
        };
        assert_eq!(constraints.validate(), Err(ConstraintError::LossCorrelationWithoutLoss));
    }

    #[test]
    fn rate_accepts_scalar_and_group_forms() {
        let scalar: LinkConstraints = serde_yaml::from_str("rate: 10M").unwrap();
        let rate = scalar.rate.unwrap();
        assert_eq!(rate.rate(), 10_000_000);
        assert_eq!(rate.limit(), DEFAULT_RATE_LIMIT);
        assert_eq!(rate.burst(), DEFAULT_RATE_BURST);

        let detailed: LinkConstraints =
            serde_yaml::from_str("rate: { rate: 10M, limit: 4K, burst: 8K }").unwrap();
        let rate = detailed.rate.unwrap();
        assert_eq!(rate.rate(), 10_000_000);
        assert_eq!(rate.limit(), 4_000);
        assert_eq!(rate.burst(), 8_000);
    }

    #[test]
    fn yaml_field_names_round_trip() {
        let parsed: LinkConstraints = serde_yaml::from_str(
            "delay: 10000\njitter: 1000\njitter-correlation: 15\nloss: 5\nloss-correlation: 30\n",
        )
        .unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.delay.unwrap().get(), 10_000);
        assert_eq!(parsed.jitter_correlation.unwrap().get(), 15);
        assert_eq!(parsed.loss_correlation.unwrap().get(), 30);
    }
}
