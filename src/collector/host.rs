//! 主机指标采集（sysinfo）

use std::path::Path;

use sysinfo::{Disks, System};

use crate::types::HostMetrics;

/// 采集负载、内存、根分区磁盘、运行时长
///
/// 读取失败（如内存总量为 0）时返回 None，调用方保留上一次的值。
pub fn collect() -> Option<HostMetrics> {
    let mut sys = System::new();
    sys.refresh_memory();

    let memory_total = sys.total_memory();
    if memory_total == 0 {
        return None;
    }

    let load = System::load_average();

    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first());
    let (disk_total, disk_used) = root
        .map(|d| {
            let total = d.total_space();
            (total, total.saturating_sub(d.available_space()))
        })
        .unwrap_or((0, 0));

    Some(HostMetrics {
        hostname: System::host_name(),
        load_average: [load.one, load.five, load.fifteen],
        memory_total,
        memory_used: sys.used_memory(),
        disk_total,
        disk_used,
        uptime_secs: System::uptime(),
        collected_at: chrono::Utc::now().timestamp_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_memory() {
        // CI 容器里磁盘和负载可能为 0，只校验内存
        if let Some(metrics) = collect() {
            assert!(metrics.memory_total > 0);
            assert!(metrics.memory_used <= metrics.memory_total);
            assert!(metrics.disk_used <= metrics.disk_total);
        }
    }
}
