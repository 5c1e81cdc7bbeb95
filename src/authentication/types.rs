use serde::{Deserialize, Serialize};

/// DKIM verdict for a received message.
///
/// The check is optional, so the verdict is tri-state: not evaluated, or
/// evaluated with a pass/fail outcome. Maps to a nullable boolean column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DkimVerdict {
    #[default]
    NotChecked,
    Checked(bool),
}

impl DkimVerdict {
    /// The nullable-boolean form used by the persisted schema.
    pub fn as_db(self) -> Option<bool> {
        match self {
            DkimVerdict::NotChecked => None,
            DkimVerdict::Checked(v) => Some(v),
        }
    }

    pub fn passed(self) -> bool {
        matches!(self, DkimVerdict::Checked(true))
    }
}

impl std::fmt::Display for DkimVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DkimVerdict::NotChecked => write!(f, "null"),
            DkimVerdict::Checked(true) => write!(f, "true"),
            DkimVerdict::Checked(false) => write!(f, "false"),
        }
    }
}

/// SPF evaluation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpfStatus {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SpfStatus::Pass => "pass",
            SpfStatus::Fail => "fail",
            SpfStatus::SoftFail => "softfail",
            SpfStatus::Neutral => "neutral",
            SpfStatus::None => "none",
            SpfStatus::TempError => "temperror",
            SpfStatus::PermError => "permerror",
        }
    }
}

impl std::fmt::Display for SpfStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DMARC verdict derived from the SPF and DKIM outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmarcStatus {
    Pass,
    Fail,
    None,
}

impl DmarcStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DmarcStatus::Pass => "pass",
            DmarcStatus::Fail => "fail",
            DmarcStatus::None => "none",
        }
    }
}

impl std::fmt::Display for DmarcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined authentication verdicts attached to a stored message.
#[derive(Debug, Clone, Copy)]
pub struct AuthResult {
    pub dkim: DkimVerdict,
    pub spf: SpfStatus,
    pub dmarc: DmarcStatus,
}

impl Default for AuthResult {
    fn default() -> Self {
        Self {
            dkim: DkimVerdict::NotChecked,
            spf: SpfStatus::None,
            dmarc: DmarcStatus::None,
        }
    }
}
