//! Resource negotiation
//!
//! A task states what it needs as `[min, max]` ranges per role. Negotiation
//! picks the largest worker count the host can sustain at the minimum, then
//! hands the spare capacity out following an [`AllocationPolicy`]. Every granted
//! value stays within its range and the sum never exceeds what the host offers.

pub mod host;

pub use host::{probe_host, HostResources, ResourceLimits};

use crate::error::TaskError;
use crate::Result;
use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Memory every process costs before any task structure is allocated
pub const PROCESS_OVERHEAD: u64 = 8 * MIB;

/// Closed range `[min, max]` of a resource amount in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRange {
    pub min: u64,
    pub max: u64,
}

impl ResourceRange {
    /// Build a range, raising `max` to `min` if given inverted
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max: max.max(min) }
    }

    pub fn exact(value: u64) -> Self {
        Self { min: value, max: value }
    }

    pub fn zero() -> Self {
        Self::exact(0)
    }

    pub fn width(&self) -> u64 {
        self.max.saturating_sub(self.min)
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Component-wise saturating sum
    pub fn plus(&self, other: &ResourceRange) -> Self {
        Self {
            min: self.min.saturating_add(other.min),
            max: self.max.saturating_add(other.max),
        }
    }

    /// Value at `ratio` of the way from `min` to `max`
    pub fn at(&self, ratio: f64) -> u64 {
        let ratio = ratio.clamp(0.0, 1.0);
        let extra = (self.width() as f64 * ratio).floor() as u64;
        self.min.saturating_add(extra).min(self.max)
    }

    /// Position of `value` inside the range, 1.0 for a zero-width range
    pub fn ratio_of(&self, value: u64) -> f64 {
        if self.width() == 0 {
            return 1.0;
        }
        let above = value.saturating_sub(self.min) as f64;
        (above / self.width() as f64).clamp(0.0, 1.0)
    }
}

/// Memory and disk needs of one role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleRequirement {
    pub memory: ResourceRange,
    pub disk: ResourceRange,
}

impl RoleRequirement {
    pub fn new(memory: ResourceRange, disk: ResourceRange) -> Self {
        Self { memory, disk }
    }

    pub fn plus(&self, other: &RoleRequirement) -> Self {
        Self {
            memory: self.memory.plus(&other.memory),
            disk: self.disk.plus(&other.disk),
        }
    }

    fn check(&self, role: &str) -> Result<()> {
        if self.memory.min > self.memory.max || self.disk.min > self.disk.max {
            anyhow::bail!("{} requirement has min above max: {:?}", role, self);
        }
        Ok(())
    }
}

/// Order in which spare capacity saturates the roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationPolicy {
    /// Same fraction of every range
    #[default]
    Balanced,
    /// Workers reach their maximum before the coordinator grows
    WorkerPreferred,
    /// The coordinator reaches its maximum before workers grow
    CoordinatorPreferred,
}

/// Complete requirement table of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirement {
    /// Coordinator process (aggregation structures)
    pub coordinator: RoleRequirement,
    /// Each worker process (stream buffers plus task structures)
    pub worker: RoleRequirement,
    /// Copy of the shared specification held by each worker
    pub shared: RoleRequirement,
    /// Sum of the worker role over the whole pool
    pub global_worker: RoleRequirement,
    /// Upper bound on the worker count, 0 for no bound
    pub max_workers: usize,
    pub memory_policy: AllocationPolicy,
    pub disk_policy: AllocationPolicy,
}

impl Default for TaskRequirement {
    fn default() -> Self {
        Self {
            coordinator: RoleRequirement::new(ResourceRange::new(MIB, 64 * MIB), ResourceRange::zero()),
            worker: RoleRequirement::new(ResourceRange::new(MIB, 64 * MIB), ResourceRange::zero()),
            shared: RoleRequirement::default(),
            global_worker: RoleRequirement::new(
                ResourceRange::new(0, u64::MAX),
                ResourceRange::new(0, u64::MAX),
            ),
            max_workers: 0,
            memory_policy: AllocationPolicy::Balanced,
            disk_policy: AllocationPolicy::Balanced,
        }
    }
}

/// Concrete amounts for one role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleGrant {
    pub memory: u64,
    pub disk: u64,
}

/// Result of a successful negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub coordinator: RoleGrant,
    /// Per worker
    pub worker: RoleGrant,
    /// Per worker
    pub shared: RoleGrant,
    pub worker_count: usize,
}

impl ResourceGrant {
    /// Memory committed across every process, overhead included
    pub fn total_memory(&self) -> u64 {
        let per_worker = self.worker.memory + self.shared.memory + PROCESS_OVERHEAD;
        self.coordinator.memory + PROCESS_OVERHEAD + per_worker * self.worker_count as u64
    }

    pub fn total_disk(&self) -> u64 {
        let per_worker = self.worker.disk + self.shared.disk;
        self.coordinator.disk + per_worker * self.worker_count as u64
    }
}

/// What a worker receives at init: its grant and the ranges needed to divide it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBudget {
    pub grant: RoleGrant,
    /// Full worker requirement the grant was negotiated against
    pub requirement: RoleRequirement,
    /// Share of the requirement that opens the record source
    pub source_memory: ResourceRange,
}

impl WorkerBudget {
    /// Split the memory grant into (record source, task structures)
    pub fn split_memory(&self) -> (u64, u64) {
        split_proportional(self.grant.memory, self.requirement.memory, self.source_memory)
    }
}

/// Negotiate a grant for `req` on `host`, with at most `worker_cap` workers
///
/// Fails with [`TaskError::ResourceUnavailable`] when the coordinator plus a
/// single worker cannot be placed at their minimums.
pub fn negotiate(req: &TaskRequirement, host: &HostResources, worker_cap: usize) -> Result<ResourceGrant> {
    req.coordinator.check("coordinator")?;
    req.worker.check("worker")?;
    req.shared.check("shared")?;
    req.global_worker.check("global worker")?;

    let coordinator_memory_min = req.coordinator.memory.min.saturating_add(PROCESS_OVERHEAD);
    if host.memory < coordinator_memory_min {
        return Err(TaskError::ResourceUnavailable(format!(
            "coordinator needs {} of memory, {} available",
            format_bytes(coordinator_memory_min),
            format_bytes(host.memory)
        ))
        .into());
    }
    if host.disk < req.coordinator.disk.min {
        return Err(TaskError::ResourceUnavailable(format!(
            "coordinator needs {} of disk, {} available",
            format_bytes(req.coordinator.disk.min),
            format_bytes(host.disk)
        ))
        .into());
    }

    let memory_left = host.memory - coordinator_memory_min;
    let disk_left = host.disk - req.coordinator.disk.min;

    let worker_memory_min = req
        .worker
        .memory
        .min
        .saturating_add(req.shared.memory.min)
        .saturating_add(PROCESS_OVERHEAD);
    let worker_disk_min = req.worker.disk.min.saturating_add(req.shared.disk.min);

    let mut count = worker_cap.max(1);
    if req.max_workers > 0 {
        count = count.min(req.max_workers);
    }
    count = count.min(fit_count(memory_left, worker_memory_min));
    count = count.min(fit_count(disk_left, worker_disk_min));
    count = count.min(fit_count(req.global_worker.memory.max, req.worker.memory.min));
    count = count.min(fit_count(req.global_worker.disk.max, req.worker.disk.min));

    if count == 0 {
        return Err(TaskError::ResourceUnavailable(format!(
            "a worker needs {} of memory and {} of disk, {} and {} left after the coordinator",
            format_bytes(worker_memory_min),
            format_bytes(worker_disk_min),
            format_bytes(memory_left),
            format_bytes(disk_left)
        ))
        .into());
    }

    let worker_memory = per_worker_range(req.worker.memory, req.global_worker.memory, count, "memory")?;
    let worker_disk = per_worker_range(req.worker.disk, req.global_worker.disk, count, "disk")?;

    let overheads = PROCESS_OVERHEAD.saturating_mul(count as u64 + 1);
    let (coordinator_memory, per_worker_memory, shared_memory) = saturate(
        req.memory_policy,
        host.memory.saturating_sub(overheads),
        req.coordinator.memory,
        worker_memory,
        req.shared.memory,
        count,
    );
    let (coordinator_disk, per_worker_disk, shared_disk) = saturate(
        req.disk_policy,
        host.disk,
        req.coordinator.disk,
        worker_disk,
        req.shared.disk,
        count,
    );

    Ok(ResourceGrant {
        coordinator: RoleGrant {
            memory: coordinator_memory,
            disk: coordinator_disk,
        },
        worker: RoleGrant {
            memory: per_worker_memory,
            disk: per_worker_disk,
        },
        shared: RoleGrant {
            memory: shared_memory,
            disk: shared_disk,
        },
        worker_count: count,
    })
}

/// Divide `granted` (negotiated against `outer`) into a sub-grant for the nested
/// `inner` range and the remainder
///
/// The sub-grant sits at the same relative position inside `inner` as `granted`
/// sits inside `outer`, never exceeding `granted` itself.
pub fn split_proportional(granted: u64, outer: ResourceRange, inner: ResourceRange) -> (u64, u64) {
    let ratio = outer.ratio_of(granted);
    let sub = inner.at(ratio).min(granted);
    (sub, granted - sub)
}

fn fit_count(available: u64, unit: u64) -> usize {
    if unit == 0 {
        return usize::MAX;
    }
    usize::try_from(available / unit).unwrap_or(usize::MAX)
}

/// Intersect the per-worker range with the pool-wide bounds divided by `count`
fn per_worker_range(
    worker: ResourceRange,
    global: ResourceRange,
    count: usize,
    what: &str,
) -> Result<ResourceRange> {
    let count = count as u64;
    let min = worker.min.max(global.min.div_ceil(count));
    let max = worker.max.min(global.max / count);
    if min > max {
        return Err(TaskError::ResourceUnavailable(format!(
            "{} workers cannot share a pool {} range of [{}, {}]",
            count,
            what,
            format_bytes(global.min),
            format_bytes(global.max)
        ))
        .into());
    }
    Ok(ResourceRange::new(min, max))
}

#[derive(Clone, Copy)]
enum Role {
    Coordinator,
    Worker,
    Shared,
}

/// Distribute `available` over the roles, minimums first, then by policy
fn saturate(
    policy: AllocationPolicy,
    available: u64,
    coordinator: ResourceRange,
    worker: ResourceRange,
    shared: ResourceRange,
    count: usize,
) -> (u64, u64, u64) {
    let n = count as u64;
    let sum_min = coordinator
        .min
        .saturating_add(n.saturating_mul(worker.min.saturating_add(shared.min)));
    let mut spare = available.saturating_sub(sum_min);

    let order = match policy {
        AllocationPolicy::Balanced => {
            let total_width = coordinator.width() as f64
                + n as f64 * (worker.width() as f64 + shared.width() as f64);
            let ratio = if total_width == 0.0 {
                1.0
            } else {
                (spare as f64 / total_width).min(1.0)
            };
            return (coordinator.at(ratio), worker.at(ratio), shared.at(ratio));
        }
        AllocationPolicy::WorkerPreferred => [Role::Worker, Role::Shared, Role::Coordinator],
        AllocationPolicy::CoordinatorPreferred => [Role::Coordinator, Role::Shared, Role::Worker],
    };

    let mut grants = (coordinator.min, worker.min, shared.min);
    for role in order {
        let (range, multiplicity) = match role {
            Role::Coordinator => (coordinator, 1),
            Role::Worker => (worker, n),
            Role::Shared => (shared, n),
        };
        let extra = range.width().min(spare / multiplicity.max(1));
        spare -= extra * multiplicity;
        match role {
            Role::Coordinator => grants.0 += extra,
            Role::Worker => grants.1 += extra,
            Role::Shared => grants.2 += extra,
        }
    }
    grants
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    if bytes == u64::MAX {
        "unbounded".to_string()
    } else if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
