use crate::error::{EngineError, Result};
use crate::models::{Decision, Mention};
use crate::policy::DecisionBands;
use crate::score;

const MENTION_BANDS: [(f64, Mention); 5] = [
    (18.0, Mention::Excellent),
    (16.0, Mention::VeryGood),
    (14.0, Mention::Good),
    (12.0, Mention::FairlyGood),
    (10.0, Mention::Pass),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierInput {
    pub average: Option<f64>,
    pub credits_obtained: i32,
    pub credits_required: i32,
    pub blocked: bool,
}

impl ClassifierInput {
    pub fn credit_ratio(&self) -> f64 {
        if self.credits_required <= 0 {
            0.0
        } else {
            f64::from(self.credits_obtained) / f64::from(self.credits_required)
        }
    }
}

impl ClassifierInput {
    fn validate(&self) -> Result<()> {
        if let Some(average) = self.average {
            score::validate_score("average", average)?;
        }
        if self.credits_obtained < 0 || self.credits_obtained > self.credits_required {
            return Err(EngineError::invalid(format!(
                "credits obtained {} must lie between 0 and the {} required",
                self.credits_obtained, self.credits_required
            )));
        }
        Ok(())
    }
}

/// Rules run in order and stop at the first hit. An administrative or
/// payment block wins before any numeric rule is looked at.
pub fn classify(input: &ClassifierInput, bands: &DecisionBands) -> Result<Decision> {
    input.validate()?;
    if input.blocked {
        return Ok(Decision::Blocked);
    }

    let average = input.average.unwrap_or(0.0);
    let ratio = input.credit_ratio();

    Ok(bands
        .bands
        .iter()
        .find(|band| average >= band.min_average && ratio >= band.min_credit_ratio)
        .map(|band| band.decision)
        .unwrap_or(bands.fallback))
}

/// Depends on the average alone, never on credits or blocks.
pub fn mention(average: Option<f64>) -> Option<Mention> {
    let average = average?;
    MENTION_BANDS
        .iter()
        .find(|(floor, _)| average >= *floor)
        .map(|(_, mention)| *mention)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(average: f64, obtained: i32, required: i32) -> ClassifierInput {
        ClassifierInput {
            average: Some(average),
            credits_obtained: obtained,
            credits_required: required,
            blocked: false,
        }
    }

    #[test]
    fn block_short_circuits_numeric_rules() {
        let blocked = ClassifierInput {
            blocked: true,
            ..input(18.0, 30, 30)
        };
        assert_eq!(classify(&blocked, &DecisionBands::default()).unwrap(), Decision::Blocked);
    }

    #[test]
    fn strictest_band_wins_first() {
        let bands = DecisionBands::default();
        assert_eq!(classify(&input(12.0, 30, 30), &bands).unwrap(), Decision::Admitted);
        assert_eq!(classify(&input(12.0, 24, 30), &bands).unwrap(), Decision::AdmittedWithDebt);
        assert_eq!(classify(&input(9.0, 30, 30), &bands).unwrap(), Decision::Deferred);
        assert_eq!(classify(&input(10.0, 12, 30), &bands).unwrap(), Decision::Refused);
        assert_eq!(classify(&input(7.99, 30, 30), &bands).unwrap(), Decision::Refused);
    }

    #[test]
    fn zero_required_credits_means_zero_ratio() {
        let no_credits = input(15.0, 0, 0);
        assert_eq!(no_credits.credit_ratio(), 0.0);
        assert_eq!(classify(&no_credits, &DecisionBands::default()).unwrap(), Decision::Refused);
    }

    #[test]
    fn missing_average_is_treated_as_zero() {
        let ungraded = ClassifierInput {
            average: None,
            ..input(0.0, 0, 30)
        };
        assert_eq!(classify(&ungraded, &DecisionBands::default()).unwrap(), Decision::Refused);
    }

    #[test]
    fn out_of_range_input_is_rejected() {
        let bands = DecisionBands::default();
        for bad in [
            input(f64::NAN, 10, 10),
            input(20.5, 10, 10),
            input(-0.5, 10, 10),
            input(12.0, 12, 10),
            input(12.0, -1, 10),
        ] {
            assert!(matches!(classify(&bad, &bands), Err(EngineError::InvalidInput(_))));
        }
        let blocked_nan = ClassifierInput {
            blocked: true,
            ..input(f64::NAN, 10, 10)
        };
        assert!(classify(&blocked_nan, &bands).is_err());
    }

    #[test]
    fn mention_bands_follow_average_only() {
        assert_eq!(mention(Some(18.0)), Some(Mention::Excellent));
        assert_eq!(mention(Some(17.99)), Some(Mention::VeryGood));
        assert_eq!(mention(Some(16.0)), Some(Mention::VeryGood));
        assert_eq!(mention(Some(14.0)), Some(Mention::Good));
        assert_eq!(mention(Some(12.0)), Some(Mention::FairlyGood));
        assert_eq!(mention(Some(10.0)), Some(Mention::Pass));
        assert_eq!(mention(Some(9.99)), None);
        assert_eq!(mention(None), None);
    }
}
