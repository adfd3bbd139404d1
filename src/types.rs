//! Core types used throughout the exchange.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant index in a coordinating group.
pub type Rank = u32;

/// Request identifier, unique within its allocation scope.
pub type RequestId = u64;

/// Point-to-point transfer tag.
pub type WireTag = u32;

/// Computational pathway requested for, or reported by, a row.
///
/// The integer codes are persisted in the store and must never be renumbered.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatingMode {
    /// Full ground-truth simulation.
    Fgs = 0,
    /// Surrogate model inference.
    Mystic = 1,
    /// Active learner decides between surrogate and simulation.
    ActiveLearner = 2,
    /// Synthetic values, for plumbing tests.
    Fake = 3,
    /// Let the oracle pick.
    Default = 4,
    /// Reduced-fidelity ground truth.
    FastFgs = 5,
    /// Closed-form analytic model.
    Analytic = 6,
    /// Shut the oracle down. Never answered.
    Kill = 9,
}

impl OperatingMode {
    /// Stable wire code.
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn is_kill(self) -> bool {
        self == Self::Kill
    }
}

impl TryFrom<i64> for OperatingMode {
    type Error = ProtocolError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Fgs),
            1 => Ok(Self::Mystic),
            2 => Ok(Self::ActiveLearner),
            3 => Ok(Self::Fake),
            4 => Ok(Self::Default),
            5 => Ok(Self::FastFgs),
            6 => Ok(Self::Analytic),
            9 => Ok(Self::Kill),
            other => Err(ProtocolError::UnknownMode(other)),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Request kinds understood by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KindTag {
    /// ICF BGK transport coefficients.
    Bgk,
    /// ICF BGK with species identified by mass.
    BgkMasses,
    /// Shale LBM to 1-D molecular dynamics adsorption.
    LbmToOneDmd,
}

impl KindTag {
    pub const ALL: [KindTag; 3] = [KindTag::Bgk, KindTag::BgkMasses, KindTag::LbmToOneDmd];

    pub fn name(self) -> &'static str {
        match self {
            Self::Bgk => "bgk",
            Self::BgkMasses => "bgkmasses",
            Self::LbmToOneDmd => "lbmToOneDMD",
        }
    }
}

/// A request row as written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRow {
    pub kind: KindTag,
    pub tag: String,
    pub rank: Rank,
    pub id: RequestId,
    pub fields: Vec<f64>,
    pub mode: OperatingMode,
}

/// A result row as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub kind: KindTag,
    pub tag: String,
    pub rank: Rank,
    pub id: RequestId,
    pub fields: Vec<f64>,
    pub provenance: i64,
}

impl ResultRow {
    /// Decode the provenance code.
    pub fn mode(&self) -> Result<OperatingMode, ProtocolError> {
        OperatingMode::try_from(self.provenance)
    }
}

/// Any row the store holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Request(RequestRow),
    Result(ResultRow),
}

impl Row {
    pub fn kind(&self) -> KindTag {
        match self {
            Row::Request(r) => r.kind,
            Row::Result(r) => r.kind,
        }
    }
}

/// Which table of a kind a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableSide {
    Requests,
    Results,
}

/// Filter on the request id column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFilter {
    Any,
    Exact(RequestId),
    /// Inclusive on both ends.
    Range(RequestId, RequestId),
}

impl IdFilter {
    pub fn matches(&self, id: RequestId) -> bool {
        match *self {
            IdFilter::Any => true,
            IdFilter::Exact(want) => id == want,
            IdFilter::Range(lo, hi) => lo <= id && id <= hi,
        }
    }
}

/// Selection over one table of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub kind: KindTag,
    pub side: TableSide,
    pub tag: Option<String>,
    pub rank: Option<Rank>,
    pub ids: IdFilter,
}

impl Predicate {
    /// Results of `kind` for one (tag, rank) stream.
    pub fn results(kind: KindTag, tag: &str, rank: Rank, ids: IdFilter) -> Self {
        Self {
            kind,
            side: TableSide::Results,
            tag: Some(tag.to_string()),
            rank: Some(rank),
            ids,
        }
    }

    /// Every request of `kind`, regardless of stream.
    pub fn all_requests(kind: KindTag) -> Self {
        Self {
            kind,
            side: TableSide::Requests,
            tag: None,
            rank: None,
            ids: IdFilter::Any,
        }
    }

    pub fn matches_stream(&self, tag: &str, rank: Rank, id: RequestId) -> bool {
        self.tag.as_deref().map_or(true, |t| t == tag)
            && self.rank.map_or(true, |r| r == rank)
            && self.ids.matches(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_codes_are_stable() {
        let expected = [
            (OperatingMode::Fgs, 0),
            (OperatingMode::Mystic, 1),
            (OperatingMode::ActiveLearner, 2),
            (OperatingMode::Fake, 3),
            (OperatingMode::Default, 4),
            (OperatingMode::FastFgs, 5),
            (OperatingMode::Analytic, 6),
            (OperatingMode::Kill, 9),
        ];
        for (mode, code) in expected {
            assert_eq!(mode.code(), code);
            assert_eq!(OperatingMode::try_from(code).unwrap(), mode);
        }
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert_eq!(
            OperatingMode::try_from(7),
            Err(ProtocolError::UnknownMode(7))
        );
    }

    #[test]
    fn test_id_filter_range_is_inclusive() {
        let f = IdFilter::Range(3, 5);
        assert!(!f.matches(2));
        assert!(f.matches(3));
        assert!(f.matches(5));
        assert!(!f.matches(6));
    }

    #[test]
    fn test_predicate_stream_match() {
        let p = Predicate::results(KindTag::Bgk, "TAG", 2, IdFilter::Exact(7));
        assert!(p.matches_stream("TAG", 2, 7));
        assert!(!p.matches_stream("TAG", 1, 7));
        assert!(!p.matches_stream("OTHER", 2, 7));

        let all = Predicate::all_requests(KindTag::Bgk);
        assert!(all.matches_stream("anything", 99, 12345));
    }
}
