//! Disease families and their class taxonomies

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label for the diseased group of a binary taxonomy.
pub const DISEASED: &str = "Diseased";
/// Label for the healthy group of a binary taxonomy.
pub const HEALTHY: &str = "Healthy";

/// Disease families screened by the pipeline. Each family has its own model
/// set, weight table and taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiseaseFamily {
    /// Foot-and-mouth disease
    Fmd,
    /// Lumpy skin disease
    Lsd,
}

impl DiseaseFamily {
    pub const ALL: [DiseaseFamily; 2] = [DiseaseFamily::Fmd, DiseaseFamily::Lsd];

    /// Short upper-case code used in reports ("FMD", "LSD").
    pub fn code(&self) -> &'static str {
        match self {
            DiseaseFamily::Fmd => "FMD",
            DiseaseFamily::Lsd => "LSD",
        }
    }
}

impl fmt::Display for DiseaseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DiseaseFamily {
    type Err = PipelineError;

    /// Accepts bare codes in any case as well as longer selector labels that
    /// contain a code, e.g. "Lumpy Skin Disease (LSD)".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if upper.contains("LSD") {
            Ok(DiseaseFamily::Lsd)
        } else if upper.contains("FMD") {
            Ok(DiseaseFamily::Fmd)
        } else {
            Err(PipelineError::UnknownFamily(s.to_string()))
        }
    }
}

/// Ordered class names a family's classifiers predict over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Taxonomy(Vec<String>);

impl Taxonomy {
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(classes.into_iter().map(Into::into).collect())
    }

    /// The two-way Diseased/Healthy taxonomy.
    pub fn binary() -> Self {
        Self::new([DISEASED, HEALTHY])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.0
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    /// Four-way taxonomies fold pairwise into Diseased/Healthy before voting.
    pub fn collapses(&self) -> bool {
        self.0.len() == 4
    }

    /// Taxonomy of the fused vote.
    pub fn output(&self) -> Taxonomy {
        if self.collapses() {
            Self::binary()
        } else {
            self.clone()
        }
    }
}
