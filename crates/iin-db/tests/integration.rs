use iin_db::{
    create_pool, get_foreign_membership, list_foreign_memberships, record_foreign_membership,
    run_migrations, DbRuntimeSettings,
};
use iin_types::{Attestation, CounterAttestedMembership, Member, Membership, SecurityDomainMemberIdentity};

#[test]
fn records_survive_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("iin.db");
    let path = path.to_str().expect("utf-8 path");

    let membership = Membership::new("network2").with_member("Org3MSP", Member::ca("pem"));
    let bundle = CounterAttestedMembership::new(
        "c2V0",
        Attestation::unsigned(SecurityDomainMemberIdentity::new("network1", "Org1MSP"), "n1"),
    );

    {
        let pool = create_pool(path, DbRuntimeSettings::default()).expect("pool");
        let mut conn = pool.get().expect("connection");
        run_migrations(&conn).expect("migrations");
        record_foreign_membership(&mut conn, &membership, &bundle, "n1").expect("record");
    }

    let pool = create_pool(path, DbRuntimeSettings::default()).expect("pool");
    let conn = pool.get().expect("connection");
    assert_eq!(run_migrations(&conn).expect("migrations"), 0);

    let stored = get_foreign_membership(&conn, "network2")
        .expect("query")
        .expect("record should persist");
    assert_eq!(stored.membership, membership);
    assert_eq!(stored.version, 1);
    assert_eq!(list_foreign_memberships(&conn).expect("list").len(), 1);
}
