use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use kiln_config::Config;
use kiln_db_connection::DbConnectionConfig;
use kiln_job_queue::{QueueSettings, WorkerConfig};

/// Build database connection config from application config.
pub fn database_config_from_config(cfg: &Config) -> DbConnectionConfig {
    let mut db_cfg = match cfg.database.url() {
        Some(url) => DbConnectionConfig::new(url),
        None => match DbConnectionConfig::from_env("KILN") {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(%error, "falling back to in-memory sqlite database");
                DbConnectionConfig::new("sqlite::memory:")
            }
        },
    };
    if let Some(max) = cfg.database.max_connections {
        db_cfg.max_connections = max;
    }
    db_cfg
}

pub fn queue_settings_from_config(cfg: &Config) -> QueueSettings {
    QueueSettings {
        stale_claim_timeout: cfg.worker.stale_claim_timeout(),
        claim_batch_size: cfg.worker.claim_batch_size,
    }
}

/// Worker `index` of `count` running in this process, with every registered
/// executor. A configured id is suffixed with the index when several workers share it.
pub fn worker_config_from_config(cfg: &Config, index: usize, count: usize) -> WorkerConfig {
    let worker_id = match cfg.worker.id.as_deref() {
        Some(id) if count > 1 => format!("{id}-{index}"),
        Some(id) => id.to_owned(),
        None => WorkerConfig::generated_id("kiln"),
    };
    let mut worker =
        WorkerConfig::new(worker_id).with_poll_interval(cfg.worker.poll_interval());
    kiln_jobs::register_all_executors(&mut worker, cfg);
    worker
}

/// Parse host:port into a SocketAddr, with fallback to 0.0.0.0.
pub fn parse_bind_address(host: &str, port: u16) -> SocketAddr {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .or_else(|_| host.parse::<SocketAddr>())
        .or_else(|_| host.parse::<Ipv6Addr>().map(|ip| SocketAddr::new(IpAddr::V6(ip), port)))
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_variants() {
        assert_eq!(
            parse_bind_address("127.0.0.1", 6100),
            "127.0.0.1:6100".parse().unwrap()
        );
        assert_eq!(parse_bind_address("::1", 80), "[::1]:80".parse().unwrap());
        assert_eq!(
            parse_bind_address("not-a-host", 6100),
            "0.0.0.0:6100".parse().unwrap()
        );
    }

    #[test]
    fn worker_ids_are_distinct_per_index() {
        let mut cfg = Config::default();
        cfg.worker.id = Some("box".into());
        assert_eq!(worker_config_from_config(&cfg, 0, 1).worker_id, "box");
        assert_eq!(worker_config_from_config(&cfg, 1, 2).worker_id, "box-1");

        cfg.worker.id = None;
        let a = worker_config_from_config(&cfg, 0, 2);
        let b = worker_config_from_config(&cfg, 1, 2);
        assert_ne!(a.worker_id, b.worker_id);
        assert!(a.worker_id.starts_with("kiln-"));
        assert_eq!(a.job_types(), vec![kiln_jobs::job_types::CLAUDE_EXTRACTION]);
    }

    #[test]
    fn database_url_and_pool_size_come_from_config() {
        let mut cfg = Config::default();
        cfg.database.path = Some("/tmp/queue.sqlite".into());
        cfg.database.max_connections = Some(3);
        let db_cfg = database_config_from_config(&cfg);
        assert_eq!(db_cfg.url, "sqlite:///tmp/queue.sqlite");
        assert_eq!(db_cfg.max_connections, 3);
    }

    #[test]
    fn queue_settings_follow_worker_section() {
        let mut cfg = Config::default();
        cfg.worker.stale_claim_timeout_secs = 90;
        cfg.worker.claim_batch_size = 4;
        let settings = queue_settings_from_config(&cfg);
        assert_eq!(settings.stale_claim_timeout.as_secs(), 90);
        assert_eq!(settings.claim_batch_size, 4);
    }
}
