use crate::types::{DangerLevel, HistoryEntry};
use anyhow::Context;
use rusqlite::{params, Connection};
use std::path::PathBuf;

const APP_NAME: &str = "kpls";
const MAX_SAMPLE_CHARS: usize = 2000;

fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn get_db_path() -> PathBuf {
    get_data_dir().join("history.db")
}

/// Opens the history database, creating it on first use.
pub fn open_history() -> anyhow::Result<Connection> {
    let path = get_db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let conn = Connection::open(&path).with_context(|| format!("opening {}", path.display()))?;
    init_db(&conn)?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request TEXT,
            command TEXT,
            danger_level TEXT,
            executed INTEGER,
            succeeded INTEGER,
            output_sample TEXT,
            timestamp INTEGER
        )",
        [],
    )?;
    Ok(())
}

pub fn save_history(
    conn: &Connection,
    entry: &HistoryEntry,
    output_sample: &str,
) -> anyhow::Result<()> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs() as i64;
    let sample: String = output_sample.chars().take(MAX_SAMPLE_CHARS).collect();

    conn.execute(
        "INSERT INTO history (request, command, danger_level, executed, succeeded, output_sample, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.request,
            entry.command,
            entry.danger_level.as_str(),
            entry.executed as i32,
            entry.succeeded as i32,
            sample,
            now
        ],
    )?;
    Ok(())
}

pub fn get_recent_history(conn: &Connection, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT request, command, danger_level, executed, succeeded FROM history
         ORDER BY timestamp DESC, id DESC LIMIT ?1",
    )?;

    let entries = stmt
        .query_map(params![limit as i64], |row| {
            let level: String = row.get(2)?;
            Ok(HistoryEntry {
                request: row.get(0)?,
                command: row.get(1)?,
                danger_level: DangerLevel::parse(&level).unwrap_or(DangerLevel::Medium),
                executed: row.get::<_, i32>(3)? != 0,
                succeeded: row.get::<_, i32>(4)? != 0,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(command: &str, level: DangerLevel, executed: bool) -> HistoryEntry {
        HistoryEntry {
            request: format!("please {}", command),
            command: command.to_string(),
            danger_level: level,
            executed,
            succeeded: executed,
        }
    }

    #[test]
    fn test_history_newest_first() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();

        let get = entry("kubectl get pods", DangerLevel::Low, true);
        save_history(&conn, &get, "api-1 Running").unwrap();
        let delete = entry("kubectl delete ns web", DangerLevel::High, false);
        save_history(&conn, &delete, "").unwrap();

        let recent = get_recent_history(&conn, 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].command, "kubectl delete ns web");
        assert_eq!(recent[0].danger_level, DangerLevel::High);
        assert!(!recent[0].executed);
        assert_eq!(recent[1].request, "please kubectl get pods");
        assert!(recent[1].succeeded);
    }

    #[test]
    fn test_history_respects_window() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        for i in 0..5 {
            let command = format!("kubectl get pod api-{}", i);
            save_history(&conn, &entry(&command, DangerLevel::Low, true), "").unwrap();
        }
        let recent = get_recent_history(&conn, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].command, "kubectl get pod api-4");
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        assert!(get_recent_history(&conn, 10).unwrap().is_empty());
    }
}
