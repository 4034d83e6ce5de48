use ndarray::Array2;

use crate::{
    error::{EngineErr, Result},
    model::TopicModel,
};

/// Additive corrections applied to the token-topic accumulator between the
/// merge and normalize steps of a pass.
///
/// A closed set: every kind carries its own typed parameters, so an unknown
/// regularizer cannot be configured at all; `validate` covers parameter
/// ranges at configuration time.
#[derive(Debug, Clone, PartialEq)]
pub enum PhiRegularizer {
    /// Smooths token-topic weights towards a uniform prior. Restricting
    /// `class_ids` limits the effect to those modalities; empty means all.
    SmoothPhi { tau: f32, class_ids: Vec<String> },
    /// Sparsing is smoothing with the correction sign flipped.
    SparsePhi { tau: f32, class_ids: Vec<String> },
    /// Pushes topics apart by penalizing tokens shared between them.
    DecorrelatorPhi { tau: f32 },
}

impl PhiRegularizer {
    pub fn validate(&self) -> Result<()> {
        let tau = match self {
            Self::SmoothPhi { tau, .. }
            | Self::SparsePhi { tau, .. }
            | Self::DecorrelatorPhi { tau } => *tau,
        };
        if !tau.is_finite() || tau < 0.0 {
            return Err(EngineErr::InvalidConfig(format!(
                "regularizer tau must be finite and non-negative, got {tau}"
            )));
        }
        Ok(())
    }

    /// Adds this regularizer's correction into `rwt`, whose rows follow
    /// `nwt`'s token table.
    pub(crate) fn apply(&self, nwt: &TopicModel, pwt: &TopicModel, rwt: &mut Array2<f32>) {
        match self {
            Self::SmoothPhi { tau, class_ids } => smooth(nwt, *tau, class_ids, rwt),
            Self::SparsePhi { tau, class_ids } => smooth(nwt, -*tau, class_ids, rwt),
            Self::DecorrelatorPhi { tau } => decorrelate(nwt, pwt, *tau, rwt),
        }
    }
}

fn smooth(nwt: &TopicModel, tau: f32, class_ids: &[String], rwt: &mut Array2<f32>) {
    for (row, token) in nwt.tokens().iter().enumerate() {
        if !class_ids.is_empty() && !class_ids.iter().any(|c| *c == token.class_id) {
            continue;
        }
        rwt.row_mut(row).mapv_inplace(|v| v + tau);
    }
}

fn decorrelate(nwt: &TopicModel, pwt: &TopicModel, tau: f32, rwt: &mut Array2<f32>) {
    for (row, token) in nwt.tokens().iter().enumerate() {
        let Some(pwt_row) = pwt.token_row(token) else {
            continue;
        };
        let total: f32 = pwt_row.sum();
        let mut out = rwt.row_mut(row);
        for (t, &p) in pwt_row.iter().enumerate() {
            out[t] -= tau * p * (total - p);
        }
    }
}

/// Corrections applied to per-item topic mixtures inside the processor's
/// inner iterations, before the mixture is renormalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThetaRegularizer {
    SmoothTheta { tau: f32 },
    SparseTheta { tau: f32 },
}

impl ThetaRegularizer {
    pub fn validate(&self) -> Result<()> {
        let tau = match self {
            Self::SmoothTheta { tau } | Self::SparseTheta { tau } => *tau,
        };
        if !tau.is_finite() || tau < 0.0 {
            return Err(EngineErr::InvalidConfig(format!(
                "regularizer tau must be finite and non-negative, got {tau}"
            )));
        }
        Ok(())
    }

    /// The signed correction added to each topic weight.
    #[inline]
    pub(crate) fn correction(&self) -> f32 {
        match self {
            Self::SmoothTheta { tau } => *tau,
            Self::SparseTheta { tau } => -*tau,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Token;
    use ndarray::array;

    fn model(name: &str, weights: Array2<f32>) -> TopicModel {
        let tokens = vec![Token::plain("a"), Token::new("@labels", "b")];
        TopicModel::new(name, vec!["t0".into(), "t1".into()], tokens, weights)
    }

    #[test]
    fn smooth_respects_class_filter() {
        let nwt = model("nwt", array![[1.0, 1.0], [1.0, 1.0]]);
        let pwt = model("pwt", array![[0.5, 0.5], [0.5, 0.5]]);
        let mut rwt = Array2::zeros((2, 2));

        let reg = PhiRegularizer::SmoothPhi {
            tau: 0.5,
            class_ids: vec!["@labels".into()],
        };
        reg.apply(&nwt, &pwt, &mut rwt);

        assert_eq!(rwt, array![[0.0, 0.0], [0.5, 0.5]]);
    }

    #[test]
    fn sparse_is_negated_smooth() {
        let nwt = model("nwt", array![[1.0, 1.0], [1.0, 1.0]]);
        let pwt = model("pwt", array![[0.5, 0.5], [0.5, 0.5]]);
        let mut rwt = Array2::zeros((2, 2));

        let reg = PhiRegularizer::SparsePhi {
            tau: 0.25,
            class_ids: Vec::new(),
        };
        reg.apply(&nwt, &pwt, &mut rwt);

        assert_eq!(rwt, array![[-0.25, -0.25], [-0.25, -0.25]]);
    }

    #[test]
    fn decorrelator_penalizes_shared_mass() {
        let nwt = model("nwt", array![[1.0, 1.0], [1.0, 1.0]]);
        let pwt = model("pwt", array![[0.4, 0.6], [1.0, 0.0]]);
        let mut rwt = Array2::zeros((2, 2));

        let reg = PhiRegularizer::DecorrelatorPhi { tau: 1.0 };
        reg.apply(&nwt, &pwt, &mut rwt);

        // First token splits mass across topics and is penalized; the
        // second sits entirely in one topic and is untouched.
        assert!((rwt[(0, 0)] + 0.4 * 0.6).abs() < 1e-6);
        assert!((rwt[(0, 1)] + 0.6 * 0.4).abs() < 1e-6);
        assert_eq!(rwt[(1, 0)], 0.0);
        assert_eq!(rwt[(1, 1)], 0.0);
    }

    #[test]
    fn negative_tau_is_rejected() {
        let reg = PhiRegularizer::DecorrelatorPhi { tau: -1.0 };
        assert!(reg.validate().is_err());

        let reg = ThetaRegularizer::SparseTheta { tau: f32::NAN };
        assert!(reg.validate().is_err());
    }
}
