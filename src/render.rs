use crate::config::ViewConfig;
use crate::poller::PollState;
use crate::resources::{
    Container, DatabaseList, EmailAccount, LogTail, MailServerStatus, SystemResources, WebsiteList,
};
use crate::snapshot::{
    ActivityCategory, ActivityEvent, DashboardSnapshot, ServiceStatus, Severity, SystemStatus,
};
use std::collections::BTreeMap;
use std::time::{Duration, UNIX_EPOCH};

pub const LOADING_TEXT: &str = "⏳ Загрузка данных...";
pub const NO_ACTIVITY_TEXT: &str = "Нет недавней активности.";
pub const RETRY_HINT: &str = "r + Enter: повторить запрос, q + Enter: выход";

pub fn format_percent(value: f64) -> String {
    format!("{value:.1}%")
}

pub fn filled_cells(percent: f64, width: usize) -> usize {
    let pct = if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    (((pct / 100.0) * width as f64).round() as usize).min(width)
}

pub fn gauge_bar(percent: f64, width: usize) -> String {
    let filled = filled_cells(percent, width);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(width - filled))
}

fn gauge_line(label: &str, percent: f64, width: usize) -> String {
    format!(
        "{label:<7} {} {:>6}",
        gauge_bar(percent, width),
        format_percent(percent)
    )
}

pub fn render_dashboard(
    state: &PollState<DashboardSnapshot>,
    view: &ViewConfig,
    now_unix: i64,
) -> String {
    let mut out = vec![format!("{} Панель хостинга", status_marker(state))];
    push_error_banner(&mut out, state);

    let Some(snapshot) = state.snapshot.as_ref() else {
        out.push(LOADING_TEXT.to_string());
        return out.join("\n");
    };

    out.push(String::new());
    out.push(format!(
        "🌐 Сайты: {} | активных {} | неактивных {} | проблемы SSL {}",
        snapshot.websites.total,
        snapshot.websites.active,
        snapshot.websites.inactive,
        snapshot.websites.ssl_issues
    ));
    out.push(format!(
        "🗄 Базы данных: {} | работают {} | остановлены {}",
        snapshot.databases.total, snapshot.databases.running, snapshot.databases.stopped
    ));
    out.push(format!(
        "🐳 Контейнеры: {} | запущены {} | образов {}",
        snapshot.containers.total, snapshot.containers.running, snapshot.containers.images
    ));
    out.push(format!(
        "👤 Пользователи: {} | активных {} | онлайн {}",
        snapshot.users.total, snapshot.users.active, snapshot.users.online
    ));

    out.push(String::new());
    out.push(gauge_line("CPU", snapshot.system.cpu_usage, view.bar_width));
    out.push(gauge_line("RAM", snapshot.system.memory_usage, view.bar_width));
    out.push(gauge_line("Диск", snapshot.system.disk_usage, view.bar_width));
    out.push(format!("⏱ Аптайм: {}", snapshot.system.uptime));

    out.push(String::new());
    out.push("📋 Последняя активность:".to_string());
    out.push(render_activity(
        &snapshot.recent_activity,
        view.activity_limit,
        now_unix,
    ));

    out.push(String::new());
    out.push(format!(
        "🕒 {}",
        format_last_update_line(state.last_success_unix, now_unix)
    ));

    out.join("\n")
}

pub fn render_activity(events: &[ActivityEvent], limit: usize, now_unix: i64) -> String {
    if events.is_empty() {
        return NO_ACTIVITY_TEXT.to_string();
    }

    events
        .iter()
        .take(limit)
        .map(|e| {
            let when = e
                .timestamp_unix()
                .map(|ts| relative_age(now_unix.saturating_sub(ts)))
                .unwrap_or_else(|| e.timestamp.clone());
            format!(
                "{} [{}] {} ({})",
                severity_icon(e.severity),
                category_title(e.category),
                e.message,
                when
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_system(state: &PollState<SystemStatus>, view: &ViewConfig, now_unix: i64) -> String {
    let mut out = vec![format!("{} Система", status_marker(state))];
    push_error_banner(&mut out, state);

    let Some(status) = state.snapshot.as_ref() else {
        out.push(LOADING_TEXT.to_string());
        return out.join("\n");
    };

    out.push(String::new());
    out.push(format!("Статус: {}", status.status));
    out.push(format!(
        "Аптайм: {}",
        human_uptime(status.uptime.max(0.0) as u64)
    ));
    if !status.load_average.is_empty() {
        out.push(format!(
            "Load average: {}",
            status
                .load_average
                .iter()
                .map(|v| format!("{v:.2}"))
                .collect::<Vec<_>>()
                .join(" ")
        ));
    }

    out.push(String::new());
    out.push(gauge_line("CPU", status.cpu_usage, view.bar_width));
    out.push(format!(
        "{} {}/{}",
        gauge_line("RAM", status.memory_usage.percent, view.bar_width),
        bytes_human(status.memory_usage.used),
        bytes_human(status.memory_usage.total)
    ));
    out.push(format!(
        "{} {}/{}",
        gauge_line("Диск", status.disk_usage.percent, view.bar_width),
        bytes_human(status.disk_usage.used),
        bytes_human(status.disk_usage.total)
    ));

    if let Some(net) = status.network_status.as_ref() {
        out.push(format!(
            "🌐 Сеть: ↑ {} ({} пакетов) / ↓ {} ({} пакетов)",
            bytes_human(net.bytes_sent),
            net.packets_sent,
            bytes_human(net.bytes_recv),
            net.packets_recv
        ));
    }

    if !status.services.is_empty() {
        out.push(String::new());
        out.push("⚙ Сервисы:".to_string());
        out.push(render_services(&status.services));
    }

    out.push(String::new());
    out.push(format!(
        "🕒 {}",
        format_last_update_line(state.last_success_unix, now_unix)
    ));

    out.join("\n")
}

pub fn render_services(services: &BTreeMap<String, ServiceStatus>) -> String {
    if services.is_empty() {
        return "Нет данных о сервисах.".to_string();
    }
    let rows = services
        .iter()
        .map(|(name, s)| {
            vec![
                if s.active { "●" } else { "○" }.to_string(),
                name.clone(),
                s.status.clone(),
                s.sub_state.clone().unwrap_or_else(|| "н/д".to_string()),
            ]
        })
        .collect::<Vec<_>>();
    render_table(&["", "Сервис", "Статус", "Состояние"], &rows)
}

pub fn render_websites(list: &WebsiteList) -> String {
    if list.websites.is_empty() {
        return "Сайтов нет.".to_string();
    }
    let rows = list
        .websites
        .iter()
        .map(|w| {
            vec![
                w.id.to_string(),
                w.domain.clone(),
                w.name.clone(),
                w.kind.clone(),
                w.status.clone(),
                if w.ssl_enabled { "да" } else { "нет" }.to_string(),
                w.php_version.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect::<Vec<_>>();
    format!(
        "{}\n\nСтраница {} ({} на странице), всего {}",
        render_table(
            &["ID", "Домен", "Название", "Тип", "Статус", "SSL", "PHP"],
            &rows
        ),
        list.page,
        list.per_page,
        list.total
    )
}

pub fn render_databases(list: &DatabaseList) -> String {
    if list.databases.is_empty() {
        return "Баз данных нет.".to_string();
    }
    let rows = list
        .databases
        .iter()
        .map(|d| {
            vec![
                d.id.to_string(),
                d.name.clone(),
                d.kind.clone(),
                d.username.clone(),
                d.status.clone(),
            ]
        })
        .collect::<Vec<_>>();
    format!(
        "{}\n\nСтраница {} ({} на странице), всего {}",
        render_table(&["ID", "Имя", "Тип", "Пользователь", "Статус"], &rows),
        list.page,
        list.per_page,
        list.total
    )
}

pub fn render_containers(containers: &[Container]) -> String {
    if containers.is_empty() {
        return "Контейнеров нет.".to_string();
    }
    let rows = containers
        .iter()
        .map(|c| {
            vec![
                c.short_id().to_string(),
                c.name.clone(),
                c.image.clone(),
                c.status.clone(),
            ]
        })
        .collect::<Vec<_>>();
    render_table(&["ID", "Имя", "Образ", "Статус"], &rows)
}

pub fn render_email_accounts(accounts: &[EmailAccount]) -> String {
    if accounts.is_empty() {
        return "Почтовых ящиков нет.".to_string();
    }
    let rows = accounts
        .iter()
        .map(|a| {
            vec![
                a.id.to_string(),
                a.email.clone(),
                a.domain.clone(),
                format!("{} МБ", a.quota),
                a.status.clone(),
            ]
        })
        .collect::<Vec<_>>();
    render_table(&["ID", "Адрес", "Домен", "Квота", "Статус"], &rows)
}

pub fn render_mail_status(status: &MailServerStatus) -> String {
    if status.is_empty() {
        return "Нет данных о почтовом сервере.".to_string();
    }
    let rows = status
        .iter()
        .map(|(name, d)| {
            vec![
                if d.running { "●" } else { "○" }.to_string(),
                name.clone(),
                d.status.clone(),
            ]
        })
        .collect::<Vec<_>>();
    render_table(&["", "Демон", "Статус"], &rows)
}

pub fn render_logs(tail: &LogTail) -> String {
    let header = format!(
        "📜 Журнал {} ({}, последние {} строк)",
        tail.service, tail.log_file, tail.lines
    );
    let content = tail.content.trim_end();
    if content.is_empty() {
        format!("{header}

Журнал пуст.")
    } else {
        format!("{header}

{content}")
    }
}

pub fn render_resources(res: &SystemResources) -> String {
    let mut out = vec!["🖥 Ресурсы сервера".to_string(), String::new()];

    let mut cpu = format!("CPU: {}", format_percent(res.cpu.usage_percent));
    if let Some(count) = res.cpu.count {
        cpu.push_str(&format!(", ядер: {count}"));
    }
    if let Some(freq) = res.cpu.frequency.as_ref() {
        cpu.push_str(&format!(", частота: {:.0} МГц", freq.current));
    }
    out.push(cpu);
    out.push(format!(
        "RAM: {} из {} ({})",
        bytes_human(res.memory.used),
        bytes_human(res.memory.total),
        format_percent(res.memory.percent)
    ));
    out.push(format!("Сетевых соединений: {}", res.network.connections));

    out.push(String::new());
    if res.disk.partitions.is_empty() {
        out.push("Разделов нет.".to_string());
    } else {
        let rows = res
            .disk
            .partitions
            .iter()
            .map(|p| {
                vec![
                    p.mountpoint.clone(),
                    p.device.clone(),
                    p.fstype.clone(),
                    bytes_human(p.used),
                    bytes_human(p.total),
                    format_percent(p.percent),
                ]
            })
            .collect::<Vec<_>>();
        out.push(render_table(
            &["Точка", "Устройство", "ФС", "Занято", "Всего", "%"],
            &rows,
        ));
    }

    if !res.network.interfaces.is_empty() {
        out.push(String::new());
        let rows = res
            .network
            .interfaces
            .iter()
            .map(|(name, iface)| {
                vec![
                    name.clone(),
                    if iface.addresses.is_empty() {
                        "-".to_string()
                    } else {
                        iface.addresses.join(", ")
                    },
                    iface.mac.clone().unwrap_or_else(|| "-".to_string()),
                ]
            })
            .collect::<Vec<_>>();
        out.push(render_table(&["Интерфейс", "IPv4", "MAC"], &rows));
    }

    out.join("\n")
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let line = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| {
                let pad = w.saturating_sub(cell.chars().count());
                format!("{cell}{}", " ".repeat(pad))
            })
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![line(headers.to_vec())];
    out.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  "),
    );
    for row in rows {
        out.push(line(row.iter().map(String::as_str).collect()));
    }
    out.join("\n")
}

fn status_marker<T>(state: &PollState<T>) -> &'static str {
    if state.error.is_some() {
        "🔴"
    } else if state.is_loading() {
        "⚪"
    } else {
        "🟢"
    }
}

fn push_error_banner<T>(out: &mut Vec<String>, state: &PollState<T>) {
    if let Some(err) = state.error.as_ref() {
        out.push(format!("⚠ Не удалось обновить данные: {err}"));
        if state.snapshot.is_some() {
            out.push("Показаны последние полученные данные.".to_string());
        }
        out.push(RETRY_HINT.to_string());
    }
}

fn severity_icon(severity: Severity) -> &'static str {
    match severity {
        Severity::Success => "✅",
        Severity::Info => "ℹ",
        Severity::Warning => "⚠",
        Severity::Error => "❌",
    }
}

fn category_title(category: ActivityCategory) -> &'static str {
    match category {
        ActivityCategory::Website => "Сайты",
        ActivityCategory::Database => "БД",
        ActivityCategory::Docker => "Docker",
        ActivityCategory::Email => "Почта",
        ActivityCategory::Ssl => "SSL",
        ActivityCategory::User => "Пользователи",
        ActivityCategory::System => "Система",
    }
}

fn bytes_human(v: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let vf = v as f64;
    if vf >= GB {
        format!("{:.1} ГБ", vf / GB)
    } else if vf >= MB {
        format!("{:.1} МБ", vf / MB)
    } else if vf >= KB {
        format!("{:.1} КБ", vf / KB)
    } else {
        format!("{} Б", v)
    }
}

fn format_unix(ts: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64);
    humantime::format_rfc3339_seconds(st).to_string()
}

fn relative_age(age_secs: i64) -> String {
    let age = age_secs.max(0) as u64;
    if age < 60 {
        format!("{} сек назад", age)
    } else if age < 3600 {
        format!("{} мин назад", age / 60)
    } else if age < 86_400 {
        format!("{} ч назад", age / 3600)
    } else {
        format!("{} д назад", age / 86_400)
    }
}

fn format_last_update_line(last_success: Option<i64>, now_unix: i64) -> String {
    match last_success {
        Some(ts) if ts > 0 => format!(
            "Последнее обновление: {} ({})",
            format_unix(ts),
            relative_age(now_unix.saturating_sub(ts))
        ),
        _ => "Последнее обновление: н/д".to_string(),
    }
}

fn human_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let mins = (secs % 3600) / 60;

    if days > 0 {
        format!("{}д {}ч {}м", days, hours, mins)
    } else if hours > 0 {
        format!("{}ч {}м", hours, mins)
    } else if mins > 0 {
        format!("{}м", mins)
    } else {
        format!("{}с", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::resources::Website;
    use crate::snapshot::fixtures;

    const NOW: i64 = 1_714_566_600; // 2024-05-01T12:30:00Z

    fn loaded(snapshot: DashboardSnapshot) -> PollState<DashboardSnapshot> {
        let mut state = PollState::default();
        state.apply_success(snapshot, NOW);
        state
    }

    fn bar_of(line: &str) -> &str {
        let start = line.find('[').expect("начало полосы");
        let end = line.find(']').expect("конец полосы");
        &line[start + 1..end]
    }

    #[test]
    fn gauges_show_one_decimal_and_proportional_bars() {
        let view = ViewConfig::default();
        let text = render_dashboard(&loaded(fixtures::dashboard(23.4, 67.0, 45.0)), &view, NOW);

        let cpu = text.lines().find(|l| l.starts_with("CPU")).unwrap();
        let ram = text.lines().find(|l| l.starts_with("RAM")).unwrap();
        let disk = text.lines().find(|l| l.starts_with("Диск")).unwrap();
        assert!(cpu.ends_with("23.4%"), "{cpu}");
        assert!(ram.ends_with("67.0%"), "{ram}");
        assert!(disk.ends_with("45.0%"), "{disk}");

        for (line, pct) in [(cpu, 23.4), (ram, 67.0), (disk, 45.0)] {
            let bar = bar_of(line);
            assert_eq!(bar.chars().count(), view.bar_width);
            let filled = bar.chars().filter(|c| *c == '█').count();
            assert_eq!(filled, filled_cells(pct, view.bar_width));
        }
        assert_eq!(filled_cells(23.4, 20), 5);
        assert_eq!(filled_cells(67.0, 20), 13);
        assert_eq!(filled_cells(45.0, 20), 9);
    }

    #[test]
    fn bars_stay_within_bounds() {
        assert_eq!(filled_cells(-5.0, 20), 0);
        assert_eq!(filled_cells(0.0, 20), 0);
        assert_eq!(filled_cells(100.0, 20), 20);
        assert_eq!(filled_cells(250.0, 20), 20);
        assert_eq!(filled_cells(f64::NAN, 20), 0);
        assert_eq!(gauge_bar(50.0, 10), "[█████░░░░░]");
    }

    #[test]
    fn empty_activity_renders_empty_state() {
        let mut snapshot = fixtures::dashboard(1.0, 1.0, 1.0);
        snapshot.recent_activity.clear();
        let text = render_dashboard(&loaded(snapshot), &ViewConfig::default(), NOW);
        assert!(text.contains(NO_ACTIVITY_TEXT));
    }

    #[test]
    fn activity_is_limited_and_keeps_order() {
        let snapshot = fixtures::dashboard(1.0, 1.0, 1.0);
        let text = render_activity(&snapshot.recent_activity, 1, NOW);
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("событие a2"));
        assert!(text.contains("0 сек назад"));
    }

    #[test]
    fn loading_indicator_before_first_snapshot() {
        let state: PollState<DashboardSnapshot> = PollState::default();
        let text = render_dashboard(&state, &ViewConfig::default(), NOW);
        assert!(text.contains(LOADING_TEXT));
        assert!(!text.contains("CPU"));
    }

    #[test]
    fn failure_keeps_data_and_shows_banner() {
        let mut state = loaded(fixtures::dashboard(23.4, 67.0, 45.0));
        state.apply_failure(
            &ClientError::Status {
                url: "http://panel/api/v1/dashboard/stats".to_string(),
                status: 502,
                body: String::new(),
            },
            NOW + 30,
        );
        let text = render_dashboard(&state, &ViewConfig::default(), NOW + 30);
        assert!(text.starts_with("🔴"));
        assert!(text.contains("Не удалось обновить данные"));
        assert!(text.contains(RETRY_HINT));
        assert!(text.contains("23.4%"));
    }

    #[test]
    fn system_view_lists_services() {
        let mut status = fixtures::system_status(12.5);
        status.services.insert(
            "nginx".to_string(),
            ServiceStatus {
                status: "active".to_string(),
                active: true,
                load_state: Some("loaded".to_string()),
                active_state: Some("active".to_string()),
                sub_state: Some("running".to_string()),
            },
        );
        let mut state = PollState::default();
        state.apply_success(status, NOW);
        let text = render_system(&state, &ViewConfig::default(), NOW);
        assert!(text.contains("Аптайм: 1д 2ч 3м"));
        assert!(text.contains("12.5%"));
        assert!(text.contains("nginx"));
        assert!(text.contains("running"));
    }

    #[test]
    fn website_table_aligns_columns() {
        let list = WebsiteList {
            websites: vec![Website {
                id: 7,
                domain: "example.com".to_string(),
                name: "Example".to_string(),
                kind: "static".to_string(),
                status: "active".to_string(),
                ssl_enabled: false,
                php_version: None,
                document_root: None,
                created_at: None,
            }],
            total: 1,
            page: 1,
            per_page: 10,
        };
        let text = render_websites(&list);
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        let _rule = lines.next().unwrap();
        let row = lines.next().unwrap();
        assert_eq!(header.find("Домен"), row.find("example.com"));
        assert!(text.contains("всего 1"));
    }

    #[test]
    fn empty_lists_have_messages() {
        assert_eq!(render_containers(&[]), "Контейнеров нет.");
        assert_eq!(render_email_accounts(&[]), "Почтовых ящиков нет.");
        assert_eq!(render_services(&BTreeMap::new()), "Нет данных о сервисах.");
    }

    #[test]
    fn uptime_and_bytes_are_human_readable() {
        assert_eq!(human_uptime(59), "59с");
        assert_eq!(human_uptime(3_660), "1ч 1м");
        assert_eq!(bytes_human(512), "512 Б");
        assert_eq!(bytes_human(1536), "1.5 КБ");
    }

    #[test]
    fn logs_show_header_and_content() {
        let tail = LogTail {
            service: "nginx".to_string(),
            log_file: "/var/log/nginx/error.log".to_string(),
            lines: 2,
            content: "first\nsecond\n".to_string(),
        };
        let text = render_logs(&tail);
        assert!(text.starts_with("📜 Журнал nginx (/var/log/nginx/error.log, последние 2 строк)"));
        assert!(text.ends_with("first\nsecond"));

        let empty = LogTail {
            content: "\n".to_string(),
            ..tail
        };
        assert!(render_logs(&empty).ends_with("Журнал пуст."));
    }

    #[test]
    fn resources_list_partitions_and_interfaces() {
        let res: SystemResources = serde_json::from_value(serde_json::json!({
            "cpu": {"usage_percent": 12.5, "count": 4, "frequency": {"current": 2400.0, "min": 0.0, "max": 0.0}},
            "memory": {"total": 1073741824u64, "available": 536870912u64, "used": 536870912u64, "percent": 50.0},
            "disk": {"partitions": [{"device": "/dev/sda1", "mountpoint": "/", "fstype": "ext4",
                "total": 1073741824u64, "used": 483183820u64, "free": 590558004u64, "percent": 45.0}]},
            "network": {"interfaces": {"eth0": {"addresses": ["10.0.0.2"], "mac": null}}, "connections": 7}
        }))
        .expect("ресурсы");
        let text = render_resources(&res);
        assert!(text.contains("CPU: 12.5%, ядер: 4, частота: 2400 МГц"));
        assert!(text.contains("RAM: 512.0 МБ из 1.0 ГБ (50.0%)"));
        assert!(text.contains("/dev/sda1"));
        assert!(text.contains("45.0%"));
        assert!(text.contains("10.0.0.2"));
    }

    #[test]
    fn mail_status_marks_running_daemons() {
        let mut status = MailServerStatus::new();
        status.insert(
            "postfix".to_string(),
            crate::resources::MailDaemon {
                status: "active".to_string(),
                running: true,
            },
        );
        let text = render_mail_status(&status);
        assert!(text.lines().any(|l| l.starts_with('●') && l.contains("postfix")));
        assert_eq!(
            render_mail_status(&MailServerStatus::new()),
            "Нет данных о почтовом сервере."
        );
    }
}
