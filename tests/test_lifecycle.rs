use lumobind::registry;
use lumobind::{
    code_by_name, CursorOp, DbFlags, EnvConfig, Environment, Error, FailureExt, TxnFlags,
    TxnStatus, WriteFlags,
};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = EnvConfig::new().max_dbs(2).open(temp_dir.path()).unwrap();
    (temp_dir, env)
}

#[test]
fn handles_go_stale_after_commit() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin(TxnFlags::empty()).unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    db.put(b"k", b"v", WriteFlags::empty()).unwrap();
    let cursor = db.open_cursor().unwrap();
    assert!(cursor.first().unwrap().is_some());

    txn.commit().unwrap();
    assert_eq!(txn.status(), TxnStatus::Committed);

    assert_eq!(db.get(b"k").unwrap_err(), Error::StaleHandle);
    assert_eq!(
        db.put(b"k", b"w", WriteFlags::empty()).unwrap_err(),
        Error::StaleHandle
    );
    assert_eq!(db.stat().unwrap_err(), Error::StaleHandle);
    assert_eq!(cursor.get(CursorOp::First).unwrap_err(), Error::StaleHandle);
    assert_eq!(cursor.count().unwrap_err(), Error::StaleHandle);

    // Ending twice is a misuse, not a retryable failure
    assert_eq!(txn.commit().unwrap_err(), Error::TxnEnded);
    assert_eq!(txn.abort().unwrap_err(), Error::TxnEnded);
    assert_eq!(txn.id().unwrap_err(), Error::TxnEnded);
    assert_eq!(
        txn.open_database(None, DbFlags::empty()).unwrap_err(),
        Error::TxnEnded
    );

    // The engine freed the cursor with the transaction; closing is still safe
    cursor.close().unwrap();
    cursor.close().unwrap();
}

#[test]
fn handles_go_stale_after_abort() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin(TxnFlags::empty()).unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    db.put(b"k", b"v", WriteFlags::empty()).unwrap();
    txn.abort().unwrap();

    assert_eq!(txn.status(), TxnStatus::Aborted);
    assert_eq!(db.get(b"k").unwrap_err(), Error::StaleHandle);
    assert_eq!(db.open_cursor().unwrap_err(), Error::StaleHandle);

    let txn = env.begin_ro().unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);
}

#[test]
fn stale_handle_failure_triple() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin(TxnFlags::empty()).unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    txn.commit().unwrap();

    let (value, message, code) = db.get(b"k").into_triple();
    assert!(value.is_none());
    assert!(message.unwrap().contains("stale"));
    assert_eq!(code, code_by_name("BAD_TXN"));
}

#[test]
fn reset_and_renew_read_transaction() {
    let (_dir, env) = setup_test_env();
    {
        let txn = env.begin(TxnFlags::empty()).unwrap();
        let db = txn.open_database(None, DbFlags::empty()).unwrap();
        db.put(b"a", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let reader = env.begin_ro().unwrap();
    let db = reader.open_database(None, DbFlags::empty()).unwrap();
    let cursor = db.open_cursor().unwrap();
    assert_eq!(db.get(b"a").unwrap().as_deref(), Some(&b"1"[..]));

    reader.reset().unwrap();
    assert_eq!(reader.status(), TxnStatus::Reset);
    assert_eq!(db.get(b"a").unwrap_err(), Error::TxnReset);
    assert_eq!(cursor.first().unwrap_err(), Error::TxnReset);
    // A second reset changes nothing
    reader.reset().unwrap();

    // A write committed while the reader is parked shows up after renew
    {
        let txn = env.begin(TxnFlags::empty()).unwrap();
        let wdb = txn.open_database(None, DbFlags::empty()).unwrap();
        wdb.put(b"b", b"2", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    reader.renew().unwrap();
    assert_eq!(reader.status(), TxnStatus::Active);
    assert_eq!(db.get(b"b").unwrap().as_deref(), Some(&b"2"[..]));

    // The cursor must be renewed before use
    assert_eq!(cursor.first().unwrap_err(), Error::StaleHandle);
    cursor.renew().unwrap();
    let keys: Vec<Vec<u8>> = cursor.iter().map(|entry| entry.unwrap().0).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

    cursor.close().unwrap();
    reader.abort().unwrap();
}

#[test]
fn reset_and_renew_need_read_only() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin(TxnFlags::empty()).unwrap();
    assert_eq!(txn.reset().unwrap_err(), Error::NotReadOnly);
    assert_eq!(txn.renew().unwrap_err(), Error::NotReadOnly);

    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    let cursor = db.open_cursor().unwrap();
    assert_eq!(cursor.renew().unwrap_err(), Error::NotReadOnly);
    assert_eq!(txn.status(), TxnStatus::Active);
    txn.abort().unwrap();
}

#[test]
fn renew_active_read_transaction_is_rejected_by_engine() {
    let (_dir, env) = setup_test_env();
    let reader = env.begin_ro().unwrap();
    assert_eq!(reader.renew().unwrap_err(), Error::Os(libc::EINVAL));
    assert_eq!(reader.status(), TxnStatus::Active);
    reader.abort().unwrap();
}

#[test]
fn nested_transactions() {
    let (_dir, env) = setup_test_env();
    let parent = env.begin(TxnFlags::empty()).unwrap();
    let db = parent.open_database(None, DbFlags::empty()).unwrap();
    db.put(b"parent", b"1", WriteFlags::empty()).unwrap();

    let child = parent.begin_child(TxnFlags::empty()).unwrap();
    assert!(child.parent().unwrap().is_some());
    let cdb = child.open_database(None, DbFlags::empty()).unwrap();
    assert_eq!(cdb.get(b"parent").unwrap().as_deref(), Some(&b"1"[..]));
    cdb.put(b"kept", b"2", WriteFlags::empty()).unwrap();
    child.commit().unwrap();
    assert_eq!(cdb.get(b"kept").unwrap_err(), Error::StaleHandle);

    let child = env.begin_nested(&parent, TxnFlags::empty()).unwrap();
    let cdb = child.open_database(None, DbFlags::empty()).unwrap();
    cdb.put(b"discarded", b"3", WriteFlags::empty()).unwrap();
    child.abort().unwrap();

    assert_eq!(db.get(b"kept").unwrap().as_deref(), Some(&b"2"[..]));
    assert_eq!(db.get(b"discarded").unwrap(), None);
    parent.commit().unwrap();
}

#[test]
fn ending_parent_ends_child() {
    let (_dir, env) = setup_test_env();
    let parent = env.begin(TxnFlags::empty()).unwrap();
    let child = parent.begin_child(TxnFlags::empty()).unwrap();
    let cdb = child.open_database(None, DbFlags::empty()).unwrap();
    cdb.put(b"k", b"v", WriteFlags::empty()).unwrap();

    parent.abort().unwrap();
    assert_eq!(child.status(), TxnStatus::Aborted);
    assert_eq!(child.commit().unwrap_err(), Error::TxnEnded);
    assert_eq!(cdb.get(b"k").unwrap_err(), Error::StaleHandle);
}

#[test]
fn child_keeps_parent_alive() {
    let (_dir, env) = setup_test_env();
    let baseline = registry::outstanding();
    {
        let parent = env.begin(TxnFlags::empty()).unwrap();
        let child = parent.begin_child(TxnFlags::empty()).unwrap();
        // The parent's last direct reference goes away; the child holds it
        drop(parent);
        let parent = child.parent().unwrap().unwrap();
        assert_eq!(parent.status(), TxnStatus::Active);

        let cdb = child.open_database(None, DbFlags::empty()).unwrap();
        cdb.put(b"k", b"v", WriteFlags::empty()).unwrap();
        child.commit().unwrap();

        let db = parent.open_database(None, DbFlags::empty()).unwrap();
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
        parent.commit().unwrap();
    }
    assert_eq!(registry::outstanding(), baseline);
}

#[test]
fn registry_references_follow_handles() {
    let (_dir, env) = setup_test_env();
    let baseline = registry::outstanding();

    let txn = env.begin(TxnFlags::empty()).unwrap();
    assert_eq!(registry::outstanding(), baseline + 1);
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    assert_eq!(registry::outstanding(), baseline + 2);
    let cursor = db.open_cursor().unwrap();
    assert_eq!(registry::outstanding(), baseline + 3);

    cursor.close().unwrap();
    assert_eq!(registry::outstanding(), baseline + 2);
    db.close().unwrap();
    db.close().unwrap();
    assert_eq!(registry::outstanding(), baseline + 1);
    assert_eq!(db.get(b"k").unwrap_err(), Error::HandleClosed);
    assert_eq!(cursor.first().unwrap_err(), Error::HandleClosed);

    txn.commit().unwrap();
    assert_eq!(registry::outstanding(), baseline);
}

#[test]
fn dropped_handles_are_finalized() {
    let (_dir, env) = setup_test_env();
    let baseline = registry::outstanding();
    {
        let txn = env.begin(TxnFlags::empty()).unwrap();
        let db = txn.open_database(None, DbFlags::empty()).unwrap();
        db.put(b"lost", b"write", WriteFlags::empty()).unwrap();
        let _cursor = db.open_cursor().unwrap();
    }
    assert_eq!(registry::outstanding(), baseline);

    // The forgotten write transaction was aborted, so a new one can start
    let txn = env.begin(TxnFlags::empty()).unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    assert_eq!(db.get(b"lost").unwrap(), None);
    txn.commit().unwrap();
}

#[test]
fn handles_navigate_to_owners() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin(TxnFlags::empty()).unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    let cursor = db.open_cursor().unwrap();

    let id = txn.id().unwrap();
    assert_eq!(db.transaction().unwrap().id().unwrap(), id);
    assert_eq!(cursor.transaction().unwrap().id().unwrap(), id);
    assert_eq!(cursor.database().unwrap().dbi(), db.dbi());
    assert!(!txn.environment().unwrap().is_closed());

    cursor.close().unwrap();
    assert_eq!(cursor.database().unwrap_err(), Error::HandleClosed);
    txn.commit().unwrap();
    assert_eq!(txn.environment().unwrap_err(), Error::TxnEnded);
}

#[test]
fn closing_environment_invalidates_descendants() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin(TxnFlags::empty()).unwrap();
    let db = txn.open_database(None, DbFlags::empty()).unwrap();
    let cursor = db.open_cursor().unwrap();
    db.put(b"k", b"v", WriteFlags::empty()).unwrap();

    env.close().unwrap();
    assert!(env.is_closed());
    assert_eq!(txn.status(), TxnStatus::Aborted);
    assert_eq!(txn.commit().unwrap_err(), Error::TxnEnded);
    assert_eq!(db.get(b"k").unwrap_err(), Error::StaleHandle);
    assert_eq!(cursor.next().unwrap_err(), Error::StaleHandle);
    cursor.close().unwrap();

    assert_eq!(env.begin_ro().unwrap_err(), Error::EnvClosed);
    assert_eq!(env.stat().unwrap_err(), Error::EnvClosed);
    env.close().unwrap();
}

#[test]
fn transactions_from_other_environment_cannot_nest() {
    let (_dir_a, env_a) = setup_test_env();
    let (_dir_b, env_b) = setup_test_env();
    let parent = env_a.begin(TxnFlags::empty()).unwrap();
    assert!(matches!(
        env_b.begin_nested(&parent, TxnFlags::empty()),
        Err(Error::InvalidArgument(_))
    ));
    parent.abort().unwrap();
}

#[test]
fn closing_environment_releases_transaction_references() {
    let (_dir, env) = setup_test_env();
    let baseline = registry::outstanding();

    let writer = env.begin(TxnFlags::empty()).unwrap();
    let child = writer.begin_child(TxnFlags::empty()).unwrap();
    assert_eq!(registry::outstanding(), baseline + 3);

    env.close().unwrap();
    assert_eq!(registry::outstanding(), baseline);
    for txn in [&writer, &child] {
        assert_eq!(txn.status(), TxnStatus::Aborted);
        assert_eq!(txn.environment().unwrap_err(), Error::TxnEnded);
        assert_eq!(txn.parent().unwrap_err(), Error::TxnEnded);
    }
}

#[test]
fn committing_parent_ends_child_with_it() {
    let (_dir, env) = setup_test_env();
    let baseline = registry::outstanding();

    let parent = env.begin(TxnFlags::empty()).unwrap();
    let child = parent.begin_child(TxnFlags::empty()).unwrap();
    assert_eq!(registry::outstanding(), baseline + 3);

    parent.commit().unwrap();
    assert_eq!(registry::outstanding(), baseline);
    assert_eq!(child.status(), TxnStatus::Committed);
    assert_eq!(child.environment().unwrap_err(), Error::TxnEnded);
    assert_eq!(child.parent().unwrap_err(), Error::TxnEnded);
    assert_eq!(child.commit().unwrap_err(), Error::TxnEnded);

    // Reclaiming the committed parent does not rewrite its outcome
    drop(parent);
    assert_eq!(child.status(), TxnStatus::Committed);
}

#[test]
fn aborting_parent_releases_child_references() {
    let (_dir, env) = setup_test_env();
    let baseline = registry::outstanding();

    let parent = env.begin(TxnFlags::empty()).unwrap();
    let child = parent.begin_child(TxnFlags::empty()).unwrap();
    let grandchild = child.begin_child(TxnFlags::empty()).unwrap();
    assert_eq!(registry::outstanding(), baseline + 5);

    parent.abort().unwrap();
    assert_eq!(registry::outstanding(), baseline);
    for txn in [&child, &grandchild] {
        assert_eq!(txn.status(), TxnStatus::Aborted);
        assert_eq!(txn.environment().unwrap_err(), Error::TxnEnded);
    }

    // The write slot is free again
    let txn = env.begin(TxnFlags::empty()).unwrap();
    txn.commit().unwrap();
}
