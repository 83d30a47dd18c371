//! Portable logical metrics and their resolution against the catalog.


use std::fmt;

use crate::catalog::{EventCatalog, EventRef};
use crate::error::{Error, Result};

/// A portable performance concept, independent of the CPU model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Metric {
    Cycles,
    Instructions,
    Branches,
    BranchMisses,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Cycles,
        Metric::Instructions,
        Metric::Branches,
        Metric::BranchMisses,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Cycles => "cycles",
            Metric::Instructions => "instructions",
            Metric::Branches => "branches",
            Metric::BranchMisses => "branch-misses",
        }
    }

    /// Candidate physical-event names from /usr/share/kpep/<name>.plist,
    /// most recent hardware first. Resolution walks the list in order and
    /// the first name present in the catalog wins, so the order encodes
    /// hardware-generation priority and must not be changed.
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            Metric::Cycles => &[
                "FIXED_CYCLES",            // Apple A7-A15
                "CPU_CLK_UNHALTED.THREAD", // Intel Core 1th-10th
                "CPU_CLK_UNHALTED.CORE",   // Intel Yonah, Merom
            ],
            Metric::Instructions => &[
                "FIXED_INSTRUCTIONS", // Apple A7-A15
                "INST_RETIRED.ANY",   // Intel Yonah, Merom, Core 1th-10th
            ],
            Metric::Branches => &[
                "INST_BRANCH",                  // Apple A7-A15
                "BR_INST_RETIRED.ALL_BRANCHES", // Intel Core 1th-10th
                "INST_RETIRED.ANY",             // Intel Yonah, Merom
            ],
            Metric::BranchMisses => &[
                "BRANCH_MISPRED_NONSPEC",       // Apple A7-A15, since iOS 15, macOS 12
                "BRANCH_MISPREDICT",            // Apple A7-A14
                "BR_MISP_RETIRED.ALL_BRANCHES", // Intel Core 2th-10th
                "BR_INST_RETIRED.MISPRED",      // Intel Yonah, Merom
            ],
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One logical metric bound to exactly one event found in the catalog.
#[derive(Clone, Copy)]
pub struct ResolvedEvent<'a> {
    pub metric: Metric,
    pub event: EventRef<'a>,
}

/// Resolves each metric to the first of its candidate events present in
/// the catalog.
///
/// First-match, not best-match: once a candidate is found the rest are
/// not considered. If any metric has no candidate in the catalog, the
/// whole resolution fails naming that metric and the partial result is
/// discarded.
pub fn resolve<'a>(
    catalog: &'a EventCatalog,
    metrics: &[Metric],
) -> Result<Vec<ResolvedEvent<'a>>> {
    let resolved = resolve_with(metrics, |name| catalog.find_by_name(name))?;
    Ok(resolved
        .into_iter()
        .map(|(metric, event)| ResolvedEvent { metric, event })
        .collect())
}

// The lookup is a closure so the first-match walk can be exercised
// without a loaded catalog.
pub(crate) fn resolve_with<T>(
    metrics: &[Metric],
    mut find: impl FnMut(&str) -> Option<T>,
) -> Result<Vec<(Metric, T)>> {
    let mut out = Vec::with_capacity(metrics.len());
    for &metric in metrics {
        let hit = metric
            .candidates()
            .iter()
            .find_map(|name| find(name).map(|ev| (metric, ev)));
        match hit {
            Some(pair) => out.push(pair),
            None => return Err(Error::UnresolvedMetric(metric)),
        }
    }
    Ok(out)
}
