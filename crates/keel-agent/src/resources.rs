use std::ops::{AddAssign, SubAssign};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CPUS, DEFAULT_DISK, DEFAULT_MEM, DEFAULT_PORTS};
use crate::error::{AgentError, AgentResult};

/// The resources offered by the agent or consumed by a task or executor.
/// Memory and disk are in megabytes. Port ranges are inclusive, kept sorted
/// and coalesced so that addition and subtraction are exact inverses, which
/// the executor resource accounting relies on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem: u64,
    pub disk: u64,
    pub ports: Vec<(u16, u16)>,
}

impl Resources {
    pub fn agent_defaults() -> Self {
        Self {
            cpus: DEFAULT_CPUS,
            mem: DEFAULT_MEM,
            disk: DEFAULT_DISK,
            ports: vec![DEFAULT_PORTS],
        }
    }

    /// Parse the `cpus:4;mem:2048;disk:10240;ports:[31000-32000,33000]`
    /// flag syntax. An empty string yields the agent defaults.
    pub fn parse(value: &str) -> AgentResult<Self> {
        if value.trim().is_empty() {
            return Ok(Self::agent_defaults());
        }
        let mut resources = Resources::default();
        for part in value.split(';').filter(|p| !p.trim().is_empty()) {
            let (name, spec) = part.split_once(':').ok_or_else(|| {
                AgentError::InvalidArgument(format!("malformed resource '{part}'"))
            })?;
            let name = name.trim();
            let spec = spec.trim();
            match name {
                "cpus" => {
                    resources.cpus = spec.parse().map_err(|_| {
                        AgentError::InvalidArgument(format!("malformed cpus value '{spec}'"))
                    })?;
                }
                "mem" => {
                    resources.mem = spec.parse().map_err(|_| {
                        AgentError::InvalidArgument(format!("malformed mem value '{spec}'"))
                    })?;
                }
                "disk" => {
                    resources.disk = spec.parse().map_err(|_| {
                        AgentError::InvalidArgument(format!("malformed disk value '{spec}'"))
                    })?;
                }
                "ports" => {
                    resources.ports = parse_ranges(spec)?;
                }
                other => {
                    return Err(AgentError::InvalidArgument(format!(
                        "unknown resource '{other}'"
                    )));
                }
            }
        }
        Ok(resources)
    }

    pub fn is_empty(&self) -> bool {
        self.cpus == 0.0 && self.mem == 0 && self.disk == 0 && self.ports.is_empty()
    }
}

fn parse_ranges(spec: &str) -> AgentResult<Vec<(u16, u16)>> {
    let inner = spec
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| {
            AgentError::InvalidArgument(format!("malformed ports value '{spec}'"))
        })?;
    let mut ranges = vec![];
    for range in inner.split(',').filter(|r| !r.trim().is_empty()) {
        let range = range.trim();
        let (begin, end) = match range.split_once('-') {
            Some((begin, end)) => (begin.trim(), end.trim()),
            None => (range, range),
        };
        let begin: u16 = begin.parse().map_err(|_| {
            AgentError::InvalidArgument(format!("malformed port range '{range}'"))
        })?;
        let end: u16 = end.parse().map_err(|_| {
            AgentError::InvalidArgument(format!("malformed port range '{range}'"))
        })?;
        if begin > end {
            return Err(AgentError::InvalidArgument(format!(
                "inverted port range '{range}'"
            )));
        }
        ranges.push((begin, end));
    }
    Ok(coalesce(ranges))
}

/// Sort and merge adjacent or overlapping ranges.
fn coalesce(mut ranges: Vec<(u16, u16)>) -> Vec<(u16, u16)> {
    ranges.sort_unstable();
    let mut out: Vec<(u16, u16)> = vec![];
    for (begin, end) in ranges {
        match out.last_mut() {
            Some((_, last_end)) if begin <= last_end.saturating_add(1) => {
                *last_end = std::cmp::max(*last_end, end);
            }
            _ => out.push((begin, end)),
        }
    }
    out
}

/// Remove `sub` from `ranges`, splitting ranges where necessary.
fn subtract_ranges(ranges: &[(u16, u16)], sub: &[(u16, u16)]) -> Vec<(u16, u16)> {
    let mut out = ranges.to_vec();
    for &(sub_begin, sub_end) in sub {
        let mut next = vec![];
        for (begin, end) in out {
            if sub_end < begin || sub_begin > end {
                next.push((begin, end));
                continue;
            }
            if begin < sub_begin {
                next.push((begin, sub_begin - 1));
            }
            if end > sub_end {
                next.push((sub_end + 1, end));
            }
        }
        out = next;
    }
    out
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, other: &Resources) {
        self.cpus += other.cpus;
        self.mem += other.mem;
        self.disk += other.disk;
        let mut ports = std::mem::take(&mut self.ports);
        ports.extend(other.ports.iter().copied());
        self.ports = coalesce(ports);
    }
}

impl SubAssign<&Resources> for Resources {
    fn sub_assign(&mut self, other: &Resources) {
        self.cpus = (self.cpus - other.cpus).max(0.0);
        self.mem = self.mem.saturating_sub(other.mem);
        self.disk = self.disk.saturating_sub(other.disk);
        self.ports = subtract_ranges(&self.ports, &other.ports);
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ports = self
            .ports
            .iter()
            .map(|(begin, end)| {
                if begin == end {
                    begin.to_string()
                } else {
                    format!("{begin}-{end}")
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "cpus:{};mem:{};disk:{};ports:[{}]",
            self.cpus, self.mem, self.disk, ports
        )
    }
}
