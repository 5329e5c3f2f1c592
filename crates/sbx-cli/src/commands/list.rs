use chrono::{DateTime, Utc};
use sbx_store::{ReconcileReport, Session};
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::error::{CliError, exit};
use crate::state::AppState;

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "PROVIDER")]
    provider: String,
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "AGE")]
    age: String,
    #[tabled(rename = "EXPIRES")]
    expires: String,
    #[tabled(rename = "TEMPLATE")]
    template: String,
}

impl SessionRow {
    fn new(session: &Session, now: DateTime<Utc>) -> Self {
        let mut status = session.status.to_string();
        if session.recovered {
            status.push_str(" (recovered)");
        }
        Self {
            name: session.id.clone(),
            status,
            provider: session.provider.to_string(),
            address: session.address.clone().unwrap_or_else(|| "-".into()),
            age: format_age(now - session.created_at),
            expires: session
                .expires_at()
                .map(|at| {
                    if at <= now {
                        "expired".to_string()
                    } else {
                        format!("in {}", format_age(at - now))
                    }
                })
                .unwrap_or_else(|| "-".into()),
            template: session.template.clone().unwrap_or_else(|| "-".into()),
        }
    }
}

pub async fn run(state: &AppState, json: bool) -> Result<i32, CliError> {
    let (sessions, report) = sbx_store::reconcile(&state.store, &state.providers).await?;
    warn_about(&report);

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(exit::SUCCESS);
    }

    if sessions.is_empty() {
        println!("No sandboxes");
        return Ok(exit::SUCCESS);
    }
    println!("{}", render(&sessions, Utc::now()));
    Ok(exit::SUCCESS)
}

fn warn_about(report: &ReconcileReport) {
    for conflict in &report.conflicts {
        eprintln!("warning: {conflict}");
    }
    for (provider, reason) in &report.skipped {
        eprintln!("warning: could not reach {provider}, its sandboxes may be stale: {reason}");
    }
    for name in &report.removed {
        eprintln!("note: {name} no longer exists at its provider and was forgotten");
    }
    for name in &report.recovered {
        eprintln!("note: found untracked sandbox {name}");
    }
}

fn render(sessions: &[Session], now: DateTime<Utc>) -> String {
    let rows: Vec<SessionRow> = sessions.iter().map(|s| SessionRow::new(s, now)).collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..7), Padding::new(0, 1, 0, 0));
    table.to_string()
}

/// Coarse human duration: `45s`, `12m`, `3h05m`, `2d4h`.
fn format_age(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d{}h", s / 86_400, (s % 86_400) / 3600),
    }
}
