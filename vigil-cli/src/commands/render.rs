//! Terminal output for views and health.

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::models::{ActiveView, ConnectionHealth, LocationRecord};

/// Prints `view` as one JSON line or as a table.
pub fn print_view(view: &ActiveView, json: bool, now: DateTime<Utc>) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(view)?);
        return Ok(());
    }

    println!("== {} ({} active) ==", view.scope, view.len());
    for record in &view.records {
        println!("{}", format_record(record, now));
    }
    Ok(())
}

pub fn print_health(health: ConnectionHealth, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&health)?);
    } else {
        match health {
            ConnectionHealth::Reconnecting { attempt } => {
                println!("-- connection: reconnecting (attempt {attempt})");
            }
            other => println!("-- connection: {}", other.label()),
        }
    }
    Ok(())
}

fn format_record(record: &LocationRecord, now: DateTime<Utc>) -> String {
    let age = (now - record.last_updated).num_seconds().max(0);
    format!(
        "{:<20} {:>10.5} {:>11.5}  {:<9} {:<24} {}s ago",
        record.subject_id,
        record.position.latitude,
        record.position.longitude,
        record.status.as_str(),
        record.display_name,
        age
    )
}
