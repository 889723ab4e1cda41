use chrono::NaiveDateTime;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{collections::BTreeSet, fmt, str::FromStr};

/// Index of a job inside its `JobGraph` arena
pub type JobId = usize;

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Clone, Copy)]
#[repr(i8)]
pub enum JobStatus {
    Suspended = -3,
    Unknown = -2,
    Failed = -1,
    Waiting = 0,
    Ready = 1,
    Submitted = 2,
    Queuing = 3,
    Running = 4,
    Completed = 5,
    Held = 6,
    Prepared = 7,
    Skipped = 8,
}

impl JobStatus {
    pub const ALL: [JobStatus; 12] = [
        JobStatus::Waiting,
        JobStatus::Prepared,
        JobStatus::Ready,
        JobStatus::Submitted,
        JobStatus::Held,
        JobStatus::Queuing,
        JobStatus::Running,
        JobStatus::Unknown,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Skipped,
        JobStatus::Suspended,
    ];

    /// Submitted to a platform and not yet known to be finished
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Queuing | Self::Running | Self::Held | Self::Unknown
        )
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether a child may treat this parent as done
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suspended => "SUSPENDED",
            Self::Unknown => "UNKNOWN",
            Self::Failed => "FAILED",
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Submitted => "SUBMITTED",
            Self::Queuing => "QUEUING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Held => "HELD",
            Self::Prepared => "PREPARED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown job status '{value}'"))
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Running {
    #[default]
    Once,
    Date,
    Member,
    Chunk,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// one job per chunk, shared by every date and member
    Date,
    /// one job per date and chunk, shared by every member
    Member,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    #[default]
    Bash,
    Python,
    R,
}

impl JobType {
    pub fn interpreter(self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Python => "python3",
            Self::R => "Rscript",
        }
    }
}

/// Wallclock request in whole minutes, written as `HH:MM`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Wallclock(pub u32);

impl Wallclock {
    pub const MAX: Wallclock = Wallclock(u32::MAX);

    pub fn minutes(self) -> u32 {
        self.0
    }

    pub fn saturating_add(self, other: Wallclock) -> Wallclock {
        Wallclock(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Wallclock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for Wallclock {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid wallclock '{value}', expected HH:MM");
        let (hours, minutes) = value.trim().split_once(':').ok_or_else(invalid)?;
        let hours: u32 = hours.parse().map_err(|_| invalid())?;
        let minutes: u32 = minutes.parse().map_err(|_| invalid())?;

        if minutes >= 60 {
            return Err(invalid());
        }

        hours
            .checked_mul(60)
            .and_then(|hours| hours.checked_add(minutes))
            .map(Wallclock)
            .ok_or_else(invalid)
    }
}

impl Serialize for Wallclock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Wallclock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(de::Error::custom)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    pub processors: u32,
    pub tasks: u32,
    pub threads: u32,
    pub nodes: u32,
    /// megabytes
    pub memory: Option<u64>,
    pub wallclock: Wallclock,
    pub platform: String,
    pub queue: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    /// submission id handed out by the platform
    pub id: Option<String>,
    pub section: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub date: Option<NaiveDateTime>,
    pub member: Option<String>,
    pub chunk: Option<u32>,
    pub split: Option<u32>,
    pub splits: Option<u32>,
    status: JobStatus,
    pub priority: i32,
    pub rank: u32,
    pub frequency: u32,
    pub delay: Option<u32>,
    pub synchronize: Option<SyncMode>,
    pub running: Running,
    pub dependencies: Vec<String>,
    pub retrials: u32,
    pub fail_count: u32,
    pub resources: Resources,
    #[serde(skip)]
    pub parents: BTreeSet<JobId>,
    #[serde(skip)]
    pub children: BTreeSet<JobId>,
    pub packed: bool,
    pub distance_weight: u32,
}

impl Job {
    pub fn new(name: String, section: String) -> Self {
        Self {
            name,
            id: None,
            section,
            job_type: JobType::default(),
            date: None,
            member: None,
            chunk: None,
            split: None,
            splits: None,
            status: JobStatus::Waiting,
            priority: 0,
            rank: 0,
            frequency: 1,
            delay: None,
            synchronize: None,
            running: Running::default(),
            dependencies: Vec::new(),
            retrials: 0,
            fail_count: 0,
            resources: Resources::default(),
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            packed: false,
            distance_weight: 0,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Only `JobGraph` may call this, it keeps the status index in sync
    pub(crate) fn replace_status(&mut self, status: JobStatus) -> JobStatus {
        std::mem::replace(&mut self.status, status)
    }

    pub fn platform(&self) -> &str {
        &self.resources.platform
    }
}

/// `EXPID[_DATE][_MEMBER][_CHUNK][_SPLIT]_SECTION`
pub fn job_name(
    expid: &str,
    date: Option<&str>,
    member: Option<&str>,
    chunk: Option<u32>,
    split: Option<u32>,
    section: &str,
) -> String {
    let mut name = String::from(expid);

    if let Some(date) = date {
        name.push('_');
        name.push_str(date);
    }
    if let Some(member) = member {
        name.push('_');
        name.push_str(member);
    }
    if let Some(chunk) = chunk {
        name.push_str(&format!("_{chunk}"));
    }
    if let Some(split) = split {
        name.push_str(&format!("_{split}"));
    }

    name.push('_');
    name.push_str(section);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_names_in_coordinate_order() {
        assert_eq!(
            job_name("a000", Some("19900101"), Some("fc0"), Some(2), None, "SIM"),
            "a000_19900101_fc0_2_SIM"
        );
        assert_eq!(
            job_name("a000", None, None, Some(1), Some(3), "POST"),
            "a000_1_3_POST"
        );
        assert_eq!(job_name("a000", None, None, None, None, "INI"), "a000_INI");
    }

    #[test]
    fn wallclock_parsing() {
        assert_eq!("02:30".parse::<Wallclock>().unwrap(), Wallclock(150));
        assert_eq!(Wallclock(61).to_string(), "01:01");
        assert!("2h".parse::<Wallclock>().is_err());
        assert!("01:75".parse::<Wallclock>().is_err());
        assert!("4000000000:00".parse::<Wallclock>().is_err());
        assert!("71582788:16".parse::<Wallclock>().is_err());
    }

    #[test]
    fn status_names_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("ready".parse::<JobStatus>().unwrap(), JobStatus::Ready);
    }
}
