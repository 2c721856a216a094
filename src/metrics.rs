use crate::poller::PollState;
use crate::snapshot::{DashboardSnapshot, SystemStatus};
use prometheus::core::Collector;
use prometheus::{opts, Counter, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub panel_websites: GaugeVec,
    pub panel_databases: GaugeVec,
    pub panel_containers: GaugeVec,
    pub panel_users: GaugeVec,
    pub panel_cpu_usage_percent: Gauge,
    pub panel_memory_usage_percent: Gauge,
    pub panel_disk_usage_percent: Gauge,
    pub panel_load_average: GaugeVec,
    pub panel_service_active: GaugeVec,
    pub poll_successes: GaugeVec,
    pub poll_failures: GaugeVec,
    pub poll_consecutive_failures: GaugeVec,
    pub poll_up: GaugeVec,
    pub poll_last_success_timestamp_seconds: GaugeVec,
    pub panelwatch_uptime_seconds: Gauge,
    pub panelwatch_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let panel_websites = GaugeVec::new(
            opts!("panel_websites", "Websites reported by the panel, by state"),
            &["state"],
        )?;
        let panel_databases = GaugeVec::new(
            opts!("panel_databases", "Databases reported by the panel, by state"),
            &["state"],
        )?;
        let panel_containers = GaugeVec::new(
            opts!(
                "panel_containers",
                "Containers and images reported by the panel, by state"
            ),
            &["state"],
        )?;
        let panel_users = GaugeVec::new(
            opts!("panel_users", "Panel users, by state"),
            &["state"],
        )?;
        let panel_cpu_usage_percent = Gauge::with_opts(opts!(
            "panel_cpu_usage_percent",
            "Server CPU usage in percent (0..100), latest snapshot"
        ))?;
        let panel_memory_usage_percent = Gauge::with_opts(opts!(
            "panel_memory_usage_percent",
            "Server memory usage in percent (0..100), latest snapshot"
        ))?;
        let panel_disk_usage_percent = Gauge::with_opts(opts!(
            "panel_disk_usage_percent",
            "Server disk usage in percent (0..100), latest snapshot"
        ))?;
        let panel_load_average = GaugeVec::new(
            opts!("panel_load_average", "Server load average"),
            &["window"],
        )?;
        let panel_service_active = GaugeVec::new(
            opts!(
                "panel_service_active",
                "1 if the service is active on the server, 0 otherwise"
            ),
            &["service"],
        )?;
        let poll_successes = GaugeVec::new(
            opts!("poll_successes", "Successful fetches by resource"),
            &["resource"],
        )?;
        let poll_failures = GaugeVec::new(
            opts!("poll_failures", "Failed fetches by resource"),
            &["resource"],
        )?;
        let poll_consecutive_failures = GaugeVec::new(
            opts!(
                "poll_consecutive_failures",
                "Failed fetches since the last success, by resource"
            ),
            &["resource"],
        )?;
        let poll_up = GaugeVec::new(
            opts!(
                "poll_up",
                "1 if the last fetch of the resource succeeded, 0 otherwise"
            ),
            &["resource"],
        )?;
        let poll_last_success_timestamp_seconds = GaugeVec::new(
            opts!(
                "poll_last_success_timestamp_seconds",
                "Unix timestamp of the last successful fetch, by resource"
            ),
            &["resource"],
        )?;
        let panelwatch_uptime_seconds = Gauge::with_opts(opts!(
            "panelwatch_uptime_seconds",
            "Seconds since panelwatch started"
        ))?;
        let panelwatch_scrape_count_total = Counter::with_opts(opts!(
            "panelwatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &panel_websites)?;
        register(&registry, &panel_databases)?;
        register(&registry, &panel_containers)?;
        register(&registry, &panel_users)?;
        register(&registry, &panel_cpu_usage_percent)?;
        register(&registry, &panel_memory_usage_percent)?;
        register(&registry, &panel_disk_usage_percent)?;
        register(&registry, &panel_load_average)?;
        register(&registry, &panel_service_active)?;
        register(&registry, &poll_successes)?;
        register(&registry, &poll_failures)?;
        register(&registry, &poll_consecutive_failures)?;
        register(&registry, &poll_up)?;
        register(&registry, &poll_last_success_timestamp_seconds)?;
        register(&registry, &panelwatch_uptime_seconds)?;
        register(&registry, &panelwatch_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            panel_websites,
            panel_databases,
            panel_containers,
            panel_users,
            panel_cpu_usage_percent,
            panel_memory_usage_percent,
            panel_disk_usage_percent,
            panel_load_average,
            panel_service_active,
            poll_successes,
            poll_failures,
            poll_consecutive_failures,
            poll_up,
            poll_last_success_timestamp_seconds,
            panelwatch_uptime_seconds,
            panelwatch_scrape_count_total,
        }))
    }

    pub fn update_dashboard(&self, state: &PollState<DashboardSnapshot>) {
        self.update_poll("dashboard", state);
        let Some(s) = state.snapshot.as_ref() else {
            return;
        };

        for (label, v) in [
            ("total", s.websites.total),
            ("active", s.websites.active),
            ("inactive", s.websites.inactive),
            ("ssl_issues", s.websites.ssl_issues),
        ] {
            self.panel_websites.with_label_values(&[label]).set(v as f64);
        }
        for (label, v) in [
            ("total", s.databases.total),
            ("running", s.databases.running),
            ("stopped", s.databases.stopped),
        ] {
            self.panel_databases.with_label_values(&[label]).set(v as f64);
        }
        for (label, v) in [
            ("total", s.containers.total),
            ("running", s.containers.running),
            ("images", s.containers.images),
        ] {
            self.panel_containers
                .with_label_values(&[label])
                .set(v as f64);
        }
        for (label, v) in [
            ("total", s.users.total),
            ("active", s.users.active),
            ("online", s.users.online),
        ] {
            self.panel_users.with_label_values(&[label]).set(v as f64);
        }

        self.panel_cpu_usage_percent.set(s.system.cpu_usage);
        self.panel_memory_usage_percent.set(s.system.memory_usage);
        self.panel_disk_usage_percent.set(s.system.disk_usage);
    }

    pub fn update_system(&self, state: &PollState<SystemStatus>) {
        self.update_poll("system", state);
        let Some(s) = state.snapshot.as_ref() else {
            return;
        };

        self.panel_cpu_usage_percent.set(s.cpu_usage);
        self.panel_memory_usage_percent.set(s.memory_usage.percent);
        self.panel_disk_usage_percent.set(s.disk_usage.percent);

        for (window, v) in ["1m", "5m", "15m"].iter().zip(&s.load_average) {
            self.panel_load_average
                .with_label_values(&[*window])
                .set(*v);
        }

        self.panel_service_active.reset();
        for (name, svc) in &s.services {
            self.panel_service_active
                .with_label_values(&[name.as_str()])
                .set(if svc.active { 1.0 } else { 0.0 });
        }
    }

    fn update_poll<T>(&self, resource: &str, state: &PollState<T>) {
        let labels = [resource];
        self.poll_successes
            .with_label_values(&labels)
            .set(state.successes as f64);
        self.poll_failures
            .with_label_values(&labels)
            .set(state.failures as f64);
        self.poll_consecutive_failures
            .with_label_values(&labels)
            .set(state.consecutive_failures as f64);
        let up = state.error.is_none() && state.snapshot.is_some();
        self.poll_up
            .with_label_values(&labels)
            .set(if up { 1.0 } else { 0.0 });
        if let Some(ts) = state.last_success_unix {
            self.poll_last_success_timestamp_seconds
                .with_label_values(&labels)
                .set(ts as f64);
        }

        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.panelwatch_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.panelwatch_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
