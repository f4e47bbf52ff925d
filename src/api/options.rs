use std::convert::TryFrom;
use tokio::time::Duration;

/// Tunables for one vault. Everything is optional; unset fields fall back to
/// production defaults. Small groups and short periods are intended for tests.
#[derive(Clone, Default)]
pub struct VaultOptions {
    /// Bound on pending request copies held across all keys.
    pub max_pending_requests: Option<usize>,
    /// Bound on resolved requests retained for idempotent replay.
    pub max_handled_requests: Option<usize>,
    /// Size of the replication group quorum arithmetic runs against.
    pub group_size: Option<usize>,
    /// Minimum holders a record may ever drop to.
    pub replication_floor: Option<usize>,
    /// Re-broadcast ceiling before an unresolved action is dropped.
    pub max_sync_attempts: Option<u32>,
    /// Period of the sync maintenance tick.
    pub sync_period: Option<Duration>,
    /// How long a Get waits for holder responses before failing.
    pub get_collation_timeout: Option<Duration>,
}

pub(crate) struct VaultOptionsValidated {
    pub max_pending_requests: usize,
    pub max_handled_requests: usize,
    pub group_size: usize,
    pub replication_floor: usize,
    pub max_sync_attempts: u32,
    pub sync_period: Duration,
    pub get_collation_timeout: Duration,
}

impl VaultOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.max_pending_requests == 0 {
            return Err("Pending request capacity must be at least 1");
        }
        if self.max_handled_requests == 0 {
            return Err("Handled request capacity must be at least 1");
        }
        if self.group_size == 0 {
            return Err("Group size must be at least 1");
        }
        if self.replication_floor == 0 {
            return Err("Replication floor must be at least 1");
        }
        if self.max_sync_attempts == 0 {
            return Err("Sync attempt ceiling must be at least 1");
        }
        if self.sync_period.is_zero() {
            return Err("Sync period must be non-zero");
        }
        if self.get_collation_timeout.is_zero() {
            return Err("Get collation timeout must be non-zero");
        }

        Ok(())
    }
}

impl TryFrom<VaultOptions> for VaultOptionsValidated {
    type Error = &'static str;

    fn try_from(options: VaultOptions) -> Result<Self, Self::Error> {
        let values = VaultOptionsValidated {
            max_pending_requests: options.max_pending_requests.unwrap_or(300),
            max_handled_requests: options.max_handled_requests.unwrap_or(1000),
            group_size: options.group_size.unwrap_or(4),
            replication_floor: options.replication_floor.unwrap_or(4),
            max_sync_attempts: options.max_sync_attempts.unwrap_or(10),
            sync_period: options.sync_period.unwrap_or(Duration::from_secs(10)),
            get_collation_timeout: options.get_collation_timeout.unwrap_or(Duration::from_secs(5)),
        };

        values.validate()?;
        Ok(values)
    }
}
