//! Crate-level tests exercising the layers together: encrypted storage
//! under the connection manager, migrations against keyed databases and
//! per-connection extension registration through manager factories.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cipher::{self, CipherProfile, Key};
use crate::{
    params, Connection, ConnectionManager, DbOption, Error, FunctionFlags, ManagedConnection,
    Migrator, OpenFlags, Result, SetupAction, Value,
};

#[test]
fn value_round_trips_through_storage_per_tag() {
    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch("CREATE TABLE t (v)").expect("create");
    let samples = [
        Value::Null,
        Value::Integer(i64::MIN),
        Value::Integer(i64::MAX),
        Value::Float(1.5),
        Value::Text("snow ❄".to_string()),
        Value::Blob(vec![0xDE, 0xAD, 0xBE, 0xEF]),
    ];
    for sample in &samples {
        conn.execute_params("DELETE FROM t", &[]).expect("clear");
        conn.execute_params("INSERT INTO t (v) VALUES (?1)", std::slice::from_ref(sample))
            .expect("insert");
        let row = conn.query_row("SELECT v FROM t", &[]).expect("read");
        assert_eq!(row.value(0), Some(sample), "tag must survive storage");
    }
}

struct NotesSchema;

impl Migrator for NotesSchema {
    fn setup(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)")
    }

    fn upgrade(&self, conn: &Connection, from: u32) -> Result<()> {
        match from {
            1 => conn.execute_batch("CREATE INDEX notes_body ON notes (body)"),
            other => Err(Error::Parameter(format!("no upgrade from version {other}"))),
        }
    }
}

#[test]
fn encrypted_store_survives_reopen_and_rejects_wrong_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("vault.db");

    let factory_path = path.clone();
    let manager = ConnectionManager::new(move || {
        let conn = cipher::open_encrypted(
            &factory_path,
            &Key::passphrase("correct horse"),
            CipherProfile::default(),
            OpenFlags::default(),
            &[SetupAction::Toggle(DbOption::ForeignKeys, true)],
        )?;
        Ok(ManagedConnection::new(conn))
    });

    manager.migrate(&NotesSchema, 2).expect("migrate");
    manager
        .execute_params("INSERT INTO notes (body) VALUES (?1)", params!["sealed"])
        .expect("insert");
    drop(manager);

    assert!(matches!(
        cipher::open_encrypted(
            &path,
            &Key::passphrase("wrong"),
            CipherProfile::default(),
            OpenFlags::default(),
            &[],
        ),
        Err(Error::Open(_))
    ));

    let reopened = cipher::open_encrypted(
        &path,
        &Key::passphrase("correct horse"),
        CipherProfile::default(),
        OpenFlags::default(),
        &[],
    )
    .expect("reopen");
    assert_eq!(reopened.user_version().expect("version"), 2);
    let row = reopened
        .query_row("SELECT body FROM notes", &[])
        .expect("read");
    assert_eq!(row.value(0), Some(&Value::Text("sealed".to_string())));
}

#[test]
fn factory_composes_extensions_on_every_connection() {
    let opens = Arc::new(AtomicUsize::new(0));
    let manager = {
        let opens = Arc::clone(&opens);
        ConnectionManager::new(move || {
            opens.fetch_add(1, Ordering::SeqCst);
            let conn = Connection::open_in_memory()?;
            conn.create_scalar_function(
                "shout",
                1,
                FunctionFlags::default().deterministic(),
                |args| {
                    let text = args[0].text_value().unwrap_or_default();
                    Ok(Value::Text(text.to_uppercase()))
                },
            )?;
            conn.set_authorizer(|action| match action {
                crate::AuthorizerAction::Delete { .. } => crate::AuthorizerVerdict::Deny,
                _ => crate::AuthorizerVerdict::Allow,
            })?;
            Ok(ManagedConnection::new(conn))
        })
    };

    manager
        .execute_batch("CREATE TABLE box_items (label TEXT)")
        .expect("create");
    manager
        .execute_params("INSERT INTO box_items (label) VALUES (?1)", params!["keep"])
        .expect("insert");

    let row = manager
        .query_row("SELECT shout(label) FROM box_items", &[])
        .expect("shout");
    assert_eq!(row.value(0), Some(&Value::Text("KEEP".to_string())));

    assert!(matches!(
        manager.execute_params("DELETE FROM box_items", &[]),
        Err(Error::Prepare(_))
    ));
    let row = manager
        .query_row("SELECT count(*) FROM box_items", &[])
        .expect("count");
    assert_eq!(row.value(0), Some(&Value::Integer(1)), "rows must survive");

    // A reload builds a fresh connection through the same factory, so the
    // registrations come back without caller involvement.
    manager.reload();
    let row = manager
        .query_row("SELECT shout('quiet')", &[])
        .expect("shout after reload");
    assert_eq!(row.value(0), Some(&Value::Text("QUIET".to_string())));
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}
