//! Periodic host status broadcasts: wall clock, load average, free memory.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::time::{self, MissedTickBehavior};
use tracing::warn;

use crate::config::DEFAULT_SYSINFO_POLL;

use super::Hub;

const MEGABYTE: u64 = 1024 * 1024;

impl Hub {
    /// Broadcast host status fragments forever. Each fragment targets its
    /// own element and is droppable like any other fragment.
    pub async fn run_sysinfo(self: Arc<Self>) {
        let mut poll = self.conf.read().await.sysinfo_poll;
        if poll == 0 {
            warn!("sysinfo poll interval is 0, forcing {} s", DEFAULT_SYSINFO_POLL);
            poll = DEFAULT_SYSINFO_POLL;
        }

        let mut system = System::new();
        let mut ticker = time::interval(Duration::from_secs(poll));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let now = chrono::Local::now();
            self.try_send_fragment(
                "sysinfo-time",
                now.format("Date: %Y-%m-%d %H:%M:%S").to_string(),
            );

            let la = System::load_average();
            self.try_send_fragment(
                "sysinfo-la",
                format!("LA: {:.2}, {:.2}, {:.2}", la.one, la.five, la.fifteen),
            );

            system.refresh_memory();
            let total = system.total_memory() / MEGABYTE;
            let free = total.saturating_sub(system.used_memory() / MEGABYTE);
            self.try_send_fragment(
                "sysinfo-mem",
                format!("Free: {} of {} MBytes", free, total),
            );
        }
    }
}
