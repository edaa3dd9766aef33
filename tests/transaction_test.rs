//! Integration tests for explicit write transactions
//!
//! Verifies isolation from readers, commit/rollback, and the single-writer rule.

use nervusdb::{Db, Error, ErrorKind, TxnState, Value};
use tempfile::TempDir;

fn open() -> (TempDir, Db) {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path()).unwrap();
    (dir, db)
}

fn count(db: &Db, label: &str) -> i64 {
    let result = db.query(&format!("MATCH (n:{}) RETURN count(n) AS c", label)).unwrap();
    result.single("c").and_then(Value::as_int).unwrap()
}

#[test]
fn test_commit_makes_writes_visible() {
    let (_dir, db) = open();
    let mut txn = db.begin_write().unwrap();
    txn.query("CREATE (:TX {v: 1})").unwrap();
    txn.query("CREATE (:TX {v: 2})").unwrap();
    assert_eq!(count(&db, "TX"), 0);
    txn.commit().unwrap();

    let result = db.query("MATCH (n:TX) RETURN n.v ORDER BY n.v").unwrap();
    assert_eq!(result.column("n.v"), vec![&Value::Int(1), &Value::Int(2)]);
}

#[test]
fn test_reads_inside_transaction_see_staged_writes() {
    let (_dir, db) = open();
    let mut txn = db.begin_write().unwrap();
    txn.query("CREATE (:Acc {name: 'a', balance: 100})").unwrap();
    txn.query("MATCH (n:Acc {name: 'a'}) SET n.balance = n.balance - 30").unwrap();
    let inside = txn.query("MATCH (n:Acc) RETURN n.balance AS b").unwrap();
    assert_eq!(inside.single("b"), Some(&Value::Int(70)));
    txn.commit().unwrap();

    let outside = db.query("MATCH (n:Acc) RETURN n.balance AS b").unwrap();
    assert_eq!(outside.single("b"), Some(&Value::Int(70)));
}

#[test]
fn test_rollback_discards_and_finishes() {
    let (_dir, db) = open();
    let mut txn = db.begin_write().unwrap();
    txn.query("CREATE (:TX {v: 99})").unwrap();
    txn.rollback().unwrap();
    assert_eq!(txn.state(), TxnState::RolledBack);
    assert_eq!(count(&db, "TX"), 0);

    let err = txn.commit().unwrap_err();
    assert!(matches!(err, Error::TxnFinished));
    assert!(err.to_string().contains("already finished"));
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[test]
fn test_commit_twice_fails() {
    let (_dir, db) = open();
    let mut txn = db.begin_write().unwrap();
    txn.query("CREATE (:TX)").unwrap();
    txn.commit().unwrap();
    assert!(matches!(txn.commit(), Err(Error::TxnFinished)));
    assert!(matches!(txn.rollback(), Err(Error::TxnFinished)));
    assert_eq!(count(&db, "TX"), 1);
}

#[test]
fn test_syntax_error_inside_transaction() {
    let (_dir, db) = open();
    let mut txn = db.begin_write().unwrap();
    txn.query("CREATE (:Keep)").unwrap();
    let err = txn.query("INVALID CYPHER !!!").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(txn.state(), TxnState::Active);
    txn.commit().unwrap();
    assert_eq!(count(&db, "Keep"), 1);
}

#[test]
fn test_failed_statement_has_no_partial_effect() {
    let (_dir, db) = open();
    db.execute_write("CREATE (:Hub)-[:R]->(:Leaf)").unwrap();

    let mut txn = db.begin_write().unwrap();
    // The new node is created before DELETE fails on the connected hub
    let err = txn.query("CREATE (:Partial) WITH 1 AS x MATCH (h:Hub) DELETE h").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert_eq!(txn.query("MATCH (n:Partial) RETURN n").unwrap().len(), 0);
    txn.commit().unwrap();
    assert_eq!(count(&db, "Partial"), 0);
    assert_eq!(count(&db, "Hub"), 1);
}

#[test]
fn test_sequential_transactions_are_independent() {
    let (_dir, db) = open();
    let mut first = db.begin_write().unwrap();
    first.query("CREATE (:Ind {batch: 1})").unwrap();
    first.commit().unwrap();

    let mut second = db.begin_write().unwrap();
    second.query("CREATE (:Ind {batch: 2})").unwrap();
    second.commit().unwrap();

    let result = db.query("MATCH (n:Ind) RETURN n.batch ORDER BY n.batch").unwrap();
    assert_eq!(result.len(), 2);
}

#[test]
fn test_single_writer() {
    let (_dir, db) = open();
    let txn = db.begin_write().unwrap();
    let err = db.begin_write().err().unwrap();
    assert!(matches!(err, Error::WriterBusy));
    assert!(db.execute_write("CREATE (:Blocked)").is_err());

    // Readers are not blocked by the open writer
    assert_eq!(count(&db, "Blocked"), 0);
    drop(txn);
    db.execute_write("CREATE (:Blocked)").unwrap();
    assert_eq!(count(&db, "Blocked"), 1);
}

#[test]
fn test_execute_write_reports_affected_entities() {
    let (_dir, db) = open();
    assert_eq!(db.execute_write("CREATE (:A {x: 1, y: 2})").unwrap(), 4);
    assert_eq!(db.execute_write("MATCH (a:A) CREATE (a)-[:R]->(:B)").unwrap(), 3);
    assert_eq!(db.execute_write("MATCH (n:Nothing) SET n.x = 1").unwrap(), 0);
}

#[test]
fn test_close_with_active_transaction_is_reported() {
    let (_dir, db) = open();
    let mut txn = db.begin_write().unwrap();
    txn.query("CREATE (:AT {v: 1})").unwrap();
    let err = db.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(!db.is_closed());

    txn.commit().unwrap();
    db.close().unwrap();
    assert!(db.is_closed());
}
