use super::Package;
use crate::{
    config::{ConfigErrors, WrapperConfig},
    graph::JobGraph,
    job::Wallclock,
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WrapperKind {
    Vertical,
    Horizontal,
    VerticalHorizontal,
    HorizontalVertical,
}

impl WrapperKind {
    pub fn has_vertical_axis(self) -> bool {
        !matches!(self, Self::Horizontal)
    }

    pub fn has_horizontal_axis(self) -> bool {
        !matches!(self, Self::Vertical)
    }
}

/// What happens to jobs whose package does not meet the wrapper minimums
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// wait for a full package, a deadlock is fatal
    Strict,
    /// wait for a full package, submit one by one on deadlock
    #[default]
    Flexible,
    /// failed jobs go out on their own right away, the rest behaves strict
    Mixed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Balance {
    #[default]
    Fill,
    RoundRobin,
}

/// A compiled wrapper group
#[derive(Debug, Clone)]
pub struct WrapperPolicy {
    pub name: String,
    pub kind: WrapperKind,
    pub mode: PolicyMode,
    sections: GlobSet,
    pub min_wrapped: usize,
    pub max_wrapped: usize,
    pub min_wrapped_h: usize,
    pub min_wrapped_v: usize,
    pub max_wrapped_h: usize,
    pub max_wrapped_v: usize,
    pub max_per_section: BTreeMap<String, usize>,
    pub balance: Balance,
    pub max_wallclock: Wallclock,
}

impl WrapperPolicy {
    pub fn from_config(name: &str, config: &WrapperConfig) -> Result<Self, ConfigErrors> {
        let mut builder = GlobSetBuilder::new();
        for pattern in config.jobs_in_wrapper.iter() {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            name: name.to_owned(),
            kind: config.kind,
            mode: config.policy,
            sections: builder.build()?,
            min_wrapped: config.min_wrapped,
            max_wrapped: config.max_wrapped.unwrap_or(usize::MAX),
            min_wrapped_h: config.min_wrapped_h,
            min_wrapped_v: config.min_wrapped_v,
            max_wrapped_h: config.max_wrapped_h.unwrap_or(usize::MAX),
            max_wrapped_v: config.max_wrapped_v.unwrap_or(usize::MAX),
            max_per_section: config.max_per_section.clone(),
            balance: config.balance,
            max_wallclock: config.max_wallclock.unwrap_or(Wallclock::MAX),
        })
    }

    /// Compile every wrapper group, in name order
    pub fn load_all(wrappers: &BTreeMap<String, WrapperConfig>) -> Result<Vec<Self>, ConfigErrors> {
        wrappers
            .iter()
            .map(|(name, config)| Self::from_config(name, config))
            .collect()
    }

    pub fn matches(&self, section: &str) -> bool {
        self.sections.is_match(section)
    }

    pub fn section_limit(&self, section: &str) -> usize {
        self.max_per_section.get(section).copied().unwrap_or(usize::MAX)
    }

    /// Whether `package` meets the minimums of this group and holds no job that failed before
    pub fn accepts(&self, package: &Package, graph: &JobGraph) -> bool {
        let size = package.jobs.len();
        let width = package.layout.width();
        let length = package.layout.length();

        let accepted = size >= self.min_wrapped
            && (!self.kind.has_horizontal_axis() || width >= self.min_wrapped_h)
            && (!self.kind.has_vertical_axis() || length >= self.min_wrapped_v)
            && package.jobs.iter().all(|id| graph.job(*id).fail_count == 0);

        trace!(
            wrapper = %self.name,
            package = %package.name,
            size = size,
            width = width,
            length = length,
            accepted = accepted,
            "Checked wrapper minimums"
        );

        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_modes_deserialize() {
        assert_eq!(
            serde_yaml::from_str::<WrapperKind>("vertical-horizontal").unwrap(),
            WrapperKind::VerticalHorizontal
        );
        assert_eq!(serde_yaml::from_str::<Balance>("round_robin").unwrap(), Balance::RoundRobin);
        assert_eq!(serde_yaml::from_str::<PolicyMode>("mixed").unwrap(), PolicyMode::Mixed);
    }

    #[test]
    fn globs_select_sections() {
        let config: WrapperConfig = serde_yaml::from_str(
            "type: horizontal\njobs_in_wrapper: [\"SIM*\", POST]\nmax_per_section:\n  POST: 2\n",
        )
        .unwrap();
        let policy = WrapperPolicy::from_config("group", &config).unwrap();

        assert!(policy.matches("SIM"));
        assert!(policy.matches("SIMX"));
        assert!(policy.matches("POST"));
        assert!(!policy.matches("INI"));
        assert_eq!(policy.section_limit("POST"), 2);
        assert_eq!(policy.section_limit("SIM"), usize::MAX);
        assert_eq!(policy.max_wallclock, Wallclock::MAX);
    }
}
