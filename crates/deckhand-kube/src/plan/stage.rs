//! Deploy stages and the markers that bound them

use serde::{Deserialize, Serialize};
use std::fmt;

/// Deploy stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Release namespace, pending release record, previous-release cleanup
    Init,
    /// Standalone CRDs
    PrePreInstall,
    /// Pre-hooks
    PreInstall,
    /// Cleanup of pre-hooks
    PreUninstall,
    /// General resources
    Install,
    /// Cleanup of general resources and CRDs
    Uninstall,
    /// Post-hooks
    PostInstall,
    /// Cleanup of post-hooks
    PostUninstall,
    /// Release bookkeeping
    Final,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Init,
        Stage::PrePreInstall,
        Stage::PreInstall,
        Stage::PreUninstall,
        Stage::Install,
        Stage::Uninstall,
        Stage::PostInstall,
        Stage::PostUninstall,
        Stage::Final,
    ];

    /// Stage where resources deployed in this stage are cleaned up
    pub fn cleanup_stage(self) -> Stage {
        match self {
            Stage::PreInstall => Stage::PreUninstall,
            Stage::PostInstall => Stage::PostUninstall,
            Stage::PrePreInstall | Stage::Install => Stage::Uninstall,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::PrePreInstall => "pre-pre-install",
            Stage::PreInstall => "pre-install",
            Stage::PreUninstall => "pre-uninstall",
            Stage::Install => "install",
            Stage::Uninstall => "uninstall",
            Stage::PostInstall => "post-install",
            Stage::PostUninstall => "post-uninstall",
            Stage::Final => "final",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CRDs of a weight deploy before everything else of that weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubGroup {
    Crds,
    Resources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Boundary {
    Start,
    End,
}

/// Position of a marker inside its stage
///
/// The derived ordering is the execution order: stage start, then weight
/// groups by ascending weight (CRD sub-group first, start before end),
/// then stage end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerPosition {
    StageStart,
    Group {
        weight: i64,
        sub: SubGroup,
        boundary: Boundary,
    },
    StageEnd,
}

impl MarkerPosition {
    pub fn group(weight: i64, sub: SubGroup, boundary: Boundary) -> Self {
        Self::Group {
            weight,
            sub,
            boundary,
        }
    }
}

impl fmt::Display for MarkerPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageStart => write!(f, "start"),
            Self::StageEnd => write!(f, "end"),
            Self::Group {
                weight,
                sub,
                boundary,
            } => {
                let sub = match sub {
                    SubGroup::Crds => "crds",
                    SubGroup::Resources => "resources",
                };
                let boundary = match boundary {
                    Boundary::Start => "start",
                    Boundary::End => "end",
                };
                write!(f, "weight/{}/{}/{}", weight, sub, boundary)
            }
        }
    }
}
