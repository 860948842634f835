//! End-to-end tests for the virtual directory engine.
//!
//! Each test composes a full stack (partition manager, adapter registry,
//! interpreter registry, engine) over in-memory backends, then drives it
//! through the public operations only.

use std::sync::Arc;

use virtdir_core::acl::{AllowAll, ReadOnlySubtrees};
use virtdir_core::cache::CacheConfig;
use virtdir_core::config::{CacheSettings, PartitionConfig};
use virtdir_core::entry::{Attributes, Dn, Modification, Rdn, SearchScope};
use virtdir_core::errors::{ResultCode, SourceError};
use virtdir_core::filter::Filter;
use virtdir_core::interpreter::InterpreterRegistry;
use virtdir_core::pool::WorkerPool;
use virtdir_core::source::{
    AdapterRegistry, Row, RowKey, RowStream, SourceAdapter, SourceConfig, VecRowStream,
};
use virtdir_core::{Engine, PartitionManager};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn attrs(pairs: &[(&str, &str)]) -> Attributes {
    let mut out = Attributes::new();
    for (name, value) in pairs {
        out.add_value(name, value.to_string());
    }
    out
}

fn dn(s: &str) -> Dn {
    Dn::parse(s).expect("test DN parses")
}

/// A backend whose writes always fail with `busy`, for cascade-abort
/// tests. Searches return the single seeded victim row.
struct BusyAdapter;

impl SourceAdapter for BusyAdapter {
    fn init(&self, _source: &SourceConfig) -> Result<(), SourceError> {
        Ok(())
    }

    fn search(
        &self,
        source: &SourceConfig,
        _filter: Option<&Filter>,
        _size_limit: usize,
    ) -> Result<Box<dyn RowStream>, SourceError> {
        let mut values = Attributes::new();
        values.add_value("uid", "victim");
        values.add_value("gid", "g1");
        let row = Row::keyed(values, source);
        Ok(Box::new(VecRowStream::sorted(vec![row])))
    }

    fn get(&self, source: &SourceConfig, key: &RowKey) -> Result<Option<Row>, SourceError> {
        let mut stream = self.search(source, None, 0)?;
        Ok(stream.next_row()?.filter(|r| r.key == *key))
    }

    fn add(&self, _source: &SourceConfig, _row: &Row) -> Result<ResultCode, SourceError> {
        Ok(ResultCode::Busy)
    }

    fn modify(
        &self,
        _source: &SourceConfig,
        _key: &RowKey,
        _changes: &[Modification],
    ) -> Result<ResultCode, SourceError> {
        Ok(ResultCode::Busy)
    }

    fn delete(&self, _source: &SourceConfig, _key: &RowKey) -> Result<ResultCode, SourceError> {
        Ok(ResultCode::Busy)
    }
}

fn registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::with_defaults();
    registry.register("busy", |_| Ok(Box::new(BusyAdapter)));
    registry
}

fn engine_for(partition_toml: &str) -> (Arc<PartitionManager>, Arc<Engine>) {
    engine_with_acl(partition_toml, Arc::new(AllowAll))
}

fn engine_with_acl(
    partition_toml: &str,
    acl: Arc<dyn virtdir_core::acl::AccessControl>,
) -> (Arc<PartitionManager>, Arc<Engine>) {
    let config: PartitionConfig = toml::from_str(partition_toml).expect("partition toml parses");
    let manager = Arc::new(PartitionManager::new(
        registry(),
        &CacheConfig::default(),
    ));
    manager.add_partition(config).expect("partition loads");
    manager.start_all();

    let engine = Arc::new(Engine::new(
        manager.clone(),
        Arc::new(InterpreterRegistry::with_defaults()),
        acl,
        WorkerPool::new(4),
        &CacheSettings::default(),
    ));
    (manager, engine)
}

/// The canonical groups partition: a static suffix, a static `ou=Groups`
/// node, and a dynamic child backed by the `groups` table.
const GROUPS_PARTITION: &str = r#"
name = "example"

[[connections]]
name = "db"
adapter = "sql"
[connections.parameters]
path = ":memory:"

[[sources]]
name = "groups"
connection = "db"
fields = [
    { name = "name", primary_key = true },
    { name = "description" },
]

[[entries]]
dn = "dc=example,dc=com"
object_classes = ["dcObject"]
[[entries.attributes]]
name = "dc"
rdn = true
value = { constant = "example" }

[[entries]]
dn = "ou=Groups,dc=example,dc=com"
object_classes = ["organizationalUnit"]
[[entries.attributes]]
name = "ou"
rdn = true
value = { constant = "Groups" }

[[entries]]
dn = "cn=...,ou=Groups,dc=example,dc=com"
object_classes = ["groupOfNames"]
[[entries.attributes]]
name = "cn"
rdn = true
value = { variable = "g.name" }
[[entries.attributes]]
name = "description"
value = { variable = "g.description" }
[[entries.sources]]
alias = "g"
source = "groups"
[[entries.sources.fields]]
name = "name"
primary_key = true
value = { variable = "rdn.cn" }
[[entries.sources.fields]]
name = "description"
value = { variable = "description" }
"#;

// ---------------------------------------------------------------------------
// End-to-end: compare over a relational source
// ---------------------------------------------------------------------------

#[test]
fn compare_entry_against_backend_row() {
    let (manager, engine) = engine_for(GROUPS_PARTITION);

    // Insert directly into the backend, as an external writer would.
    let partition = manager.partition("example").unwrap();
    let source = partition.source_config("groups").unwrap();
    let connection = partition.connection("db").unwrap();
    let row = Row::keyed(attrs(&[("name", "test"), ("description", "correct")]), &source);
    assert_eq!(
        connection.adapter().add(&source, &row).unwrap(),
        ResultCode::Success
    );

    let target = dn("cn=test,ou=Groups,dc=example,dc=com");
    assert!(engine
        .compare(&Dn::root(), &target, "description", "correct")
        .unwrap());
    assert!(!engine
        .compare(&Dn::root(), &target, "description", "wrong")
        .unwrap());
}

#[test]
fn add_then_search_and_delete_dynamic_entry() {
    let (_manager, engine) = engine_for(GROUPS_PARTITION);
    let target = dn("cn=admins,ou=Groups,dc=example,dc=com");

    engine
        .add(
            &Dn::root(),
            &target,
            &attrs(&[("cn", "admins"), ("description", "administrators")]),
        )
        .unwrap();

    // Visible through the engine immediately (write-through refresh).
    let found = engine.find_entry(&Dn::root(), &target).unwrap();
    assert_eq!(found.attributes.value("description"), Some("administrators"));
    assert_eq!(found.attributes.values("objectClass"), &["groupOfNames".to_string()]);

    // Subtree search from the suffix sees the static and dynamic entries.
    let results = engine
        .search(
            &Dn::root(),
            &dn("dc=example,dc=com"),
            SearchScope::Sub,
            None,
            0,
        )
        .unwrap();
    let dns: Vec<String> = results.iter().map(|r| r.dn.to_string()).collect();
    assert!(dns.contains(&"dc=example,dc=com".to_string()));
    assert!(dns.contains(&"ou=Groups,dc=example,dc=com".to_string()));
    assert!(dns.contains(&"cn=admins,ou=Groups,dc=example,dc=com".to_string()));

    engine.delete(&Dn::root(), &target).unwrap();
    let gone = engine.find_entry(&Dn::root(), &target);
    assert_eq!(gone.unwrap_err().code, ResultCode::NoSuchObject);
}

#[test]
fn modify_dynamic_entry_reaches_backend_and_readers() {
    let (_manager, engine) = engine_for(GROUPS_PARTITION);
    let target = dn("cn=ops,ou=Groups,dc=example,dc=com");
    engine
        .add(&Dn::root(), &target, &attrs(&[("cn", "ops"), ("description", "old")]))
        .unwrap();

    engine
        .modify(
            &Dn::root(),
            &target,
            &[Modification::replace("description", vec!["new".into()])],
        )
        .unwrap();

    assert!(engine.compare(&Dn::root(), &target, "description", "new").unwrap());
    assert!(!engine.compare(&Dn::root(), &target, "description", "old").unwrap());
}

#[test]
fn modrdn_renames_primary_row() {
    let (_manager, engine) = engine_for(GROUPS_PARTITION);
    let target = dn("cn=oldname,ou=Groups,dc=example,dc=com");
    engine
        .add(&Dn::root(), &target, &attrs(&[("cn", "oldname"), ("description", "d")]))
        .unwrap();

    engine
        .modrdn(&Dn::root(), &target, &Rdn::new("cn", "newname"), true)
        .unwrap();

    let renamed = dn("cn=newname,ou=Groups,dc=example,dc=com");
    assert!(engine.find_entry(&Dn::root(), &renamed).is_ok());
    assert_eq!(
        engine.find_entry(&Dn::root(), &target).unwrap_err().code,
        ResultCode::NoSuchObject
    );
}

#[test]
fn search_size_limit_fails_instead_of_truncating() {
    let (_manager, engine) = engine_for(GROUPS_PARTITION);
    for name in ["a", "b", "c"] {
        let target = dn(&format!("cn={},ou=Groups,dc=example,dc=com", name));
        engine
            .add(&Dn::root(), &target, &attrs(&[("cn", name), ("description", "x")]))
            .unwrap();
    }

    let err = engine
        .search(
            &Dn::root(),
            &dn("dc=example,dc=com"),
            SearchScope::Sub,
            None,
            2,
        )
        .unwrap_err();
    assert_eq!(err.code, ResultCode::SizeLimitExceeded);
}

#[test]
fn unknown_dn_is_no_such_object_not_a_panic() {
    let (_manager, engine) = engine_for(GROUPS_PARTITION);
    let err = engine
        .search(
            &Dn::root(),
            &dn("dc=elsewhere,dc=org"),
            SearchScope::Base,
            None,
            0,
        )
        .unwrap_err();
    assert_eq!(err.code, ResultCode::NoSuchObject);
}

// ---------------------------------------------------------------------------
// Static tree operations
// ---------------------------------------------------------------------------

#[test]
fn static_add_creates_child_mapping_and_delete_refuses_non_leaf() {
    let (manager, engine) = engine_for(GROUPS_PARTITION);
    let child = dn("ou=Nested,ou=Groups,dc=example,dc=com");
    let grandchild = dn("ou=Deep,ou=Nested,ou=Groups,dc=example,dc=com");

    engine
        .add(
            &Dn::root(),
            &child,
            &attrs(&[("objectClass", "organizationalUnit"), ("ou", "Nested")]),
        )
        .unwrap();
    engine
        .add(
            &Dn::root(),
            &grandchild,
            &attrs(&[("objectClass", "organizationalUnit"), ("ou", "Deep")]),
        )
        .unwrap();

    let before = manager.list_entry_ids("example").unwrap().len();

    // Deleting a non-leaf static entry must fail and leave the tree as-is.
    let err = engine.delete(&Dn::root(), &child).unwrap_err();
    assert_eq!(err.code, ResultCode::NotAllowedOnNonLeaf);
    assert_eq!(manager.list_entry_ids("example").unwrap().len(), before);
    assert!(engine.find_entry(&Dn::root(), &grandchild).is_ok());

    // Leaf-first removal succeeds.
    engine.delete(&Dn::root(), &grandchild).unwrap();
    engine.delete(&Dn::root(), &child).unwrap();
    assert_eq!(
        manager.list_entry_ids("example").unwrap().len(),
        before - 2
    );
}

#[test]
fn static_modify_edits_attribute_mappings() {
    let (_manager, engine) = engine_for(GROUPS_PARTITION);
    let target = dn("ou=Groups,dc=example,dc=com");

    engine
        .modify(
            &Dn::root(),
            &target,
            &[Modification::add("description", vec!["all groups".into()])],
        )
        .unwrap();
    assert!(engine
        .compare(&Dn::root(), &target, "description", "all groups")
        .unwrap());

    engine
        .modify(&Dn::root(), &target, &[Modification::delete("description")])
        .unwrap();
    assert!(!engine
        .compare(&Dn::root(), &target, "description", "all groups")
        .unwrap());
}

// ---------------------------------------------------------------------------
// Join graph: multi-source entries and cascades
// ---------------------------------------------------------------------------

/// Users joined with per-user profile rows across two memory sources.
const JOINED_PARTITION: &str = r#"
name = "people"

[[connections]]
name = "mem"
adapter = "memory"

[[sources]]
name = "users"
connection = "mem"
fields = [
    { name = "uid", primary_key = true },
    { name = "cn" },
]

[[sources]]
name = "profiles"
connection = "mem"
fields = [
    { name = "uid", primary_key = true },
    { name = "mail" },
]

[[entries]]
dn = "dc=people,dc=com"
object_classes = ["dcObject"]
[[entries.attributes]]
name = "dc"
rdn = true
value = { constant = "people" }

[[entries]]
dn = "uid=...,dc=people,dc=com"
object_classes = ["inetOrgPerson"]
[[entries.attributes]]
name = "uid"
rdn = true
value = { variable = "u.uid" }
[[entries.attributes]]
name = "cn"
value = { variable = "u.cn" }
[[entries.attributes]]
name = "mail"
value = { variable = "p.mail" }
[[entries.sources]]
alias = "u"
source = "users"
[[entries.sources.fields]]
name = "uid"
primary_key = true
value = { variable = "rdn.uid" }
[[entries.sources.fields]]
name = "cn"
value = { variable = "cn" }
[[entries.sources]]
alias = "p"
source = "profiles"
[[entries.sources.fields]]
name = "uid"
primary_key = true
value = { variable = "rdn.uid" }
[[entries.sources.fields]]
name = "mail"
value = { variable = "mail" }
[[entries.relationships]]
lhs = "u.uid"
rhs = "p.uid"
"#;

#[test]
fn multi_source_entry_merges_rows() {
    let (manager, engine) = engine_for(JOINED_PARTITION);
    let partition = manager.partition("people").unwrap();
    let users = partition.source_config("users").unwrap();
    let profiles = partition.source_config("profiles").unwrap();
    let connection = partition.connection("mem").unwrap();

    let adapter = connection.adapter();
    adapter
        .add(&users, &Row::keyed(attrs(&[("uid", "jdoe"), ("cn", "John Doe")]), &users))
        .unwrap();
    adapter
        .add(
            &profiles,
            &Row::keyed(attrs(&[("uid", "jdoe"), ("mail", "jdoe@people.com")]), &profiles),
        )
        .unwrap();

    let entry = engine
        .find_entry(&Dn::root(), &dn("uid=jdoe,dc=people,dc=com"))
        .unwrap();
    assert_eq!(entry.attributes.value("cn"), Some("John Doe"));
    assert_eq!(entry.attributes.value("mail"), Some("jdoe@people.com"));
    assert_eq!(
        entry.source_values.values("p.mail"),
        &["jdoe@people.com".to_string()]
    );
}

#[test]
fn cascaded_add_writes_both_sources() {
    let (manager, engine) = engine_for(JOINED_PARTITION);
    let target = dn("uid=amy,dc=people,dc=com");
    engine
        .add(
            &Dn::root(),
            &target,
            &attrs(&[("uid", "amy"), ("cn", "Amy"), ("mail", "amy@people.com")]),
        )
        .unwrap();

    let partition = manager.partition("people").unwrap();
    let connection = partition.connection("mem").unwrap();
    let users = partition.source_config("users").unwrap();
    let profiles = partition.source_config("profiles").unwrap();

    let key = RowKey::single("uid", "amy");
    assert!(connection.adapter().get(&users, &key).unwrap().is_some());
    assert!(connection.adapter().get(&profiles, &key).unwrap().is_some());
}

#[test]
fn cascaded_delete_tolerates_absent_dependent() {
    let (manager, engine) = engine_for(JOINED_PARTITION);
    let partition = manager.partition("people").unwrap();
    let connection = partition.connection("mem").unwrap();
    let users = partition.source_config("users").unwrap();
    let profiles = partition.source_config("profiles").unwrap();

    // Primary row exists; the dependent profile row is already absent.
    connection
        .adapter()
        .add(&users, &Row::keyed(attrs(&[("uid", "solo"), ("cn", "Solo")]), &users))
        .unwrap();

    engine
        .delete(&Dn::root(), &dn("uid=solo,dc=people,dc=com"))
        .unwrap();

    let key = RowKey::single("uid", "solo");
    assert!(connection.adapter().get(&users, &key).unwrap().is_none());
    assert!(connection.adapter().get(&profiles, &key).unwrap().is_none());
}

/// Primary on a backend whose writes fail; dependent on memory.
const BUSY_PRIMARY_PARTITION: &str = r#"
name = "busyp"

[[connections]]
name = "locked"
adapter = "busy"

[[connections]]
name = "mem"
adapter = "memory"

[[sources]]
name = "accounts"
connection = "locked"
fields = [{ name = "uid", primary_key = true }, { name = "gid" }]

[[sources]]
name = "profiles"
connection = "mem"
fields = [{ name = "uid", primary_key = true }, { name = "mail" }]

[[entries]]
dn = "dc=busy,dc=com"
object_classes = ["dcObject"]
[[entries.attributes]]
name = "dc"
rdn = true
value = { constant = "busy" }

[[entries]]
dn = "uid=...,dc=busy,dc=com"
object_classes = ["account"]
[[entries.attributes]]
name = "uid"
rdn = true
value = { variable = "a.uid" }
[[entries.attributes]]
name = "mail"
value = { variable = "p.mail" }
[[entries.sources]]
alias = "a"
source = "accounts"
[[entries.sources.fields]]
name = "uid"
primary_key = true
value = { variable = "rdn.uid" }
[[entries.sources]]
alias = "p"
source = "profiles"
[[entries.sources.fields]]
name = "uid"
primary_key = true
value = { variable = "rdn.uid" }
[[entries.relationships]]
lhs = "a.uid"
rhs = "p.uid"
"#;

#[test]
fn primary_failure_aborts_cascade_before_dependents() {
    let (manager, engine) = engine_for(BUSY_PRIMARY_PARTITION);
    let partition = manager.partition("busyp").unwrap();
    let mem = partition.connection("mem").unwrap();
    let profiles = partition.source_config("profiles").unwrap();

    // Seed the dependent row; the primary "victim" row comes from the
    // busy adapter's fixed search result.
    let key = RowKey::single("uid", "victim");
    mem.adapter()
        .add(
            &profiles,
            &Row::keyed(attrs(&[("uid", "victim"), ("mail", "v@busy.com")]), &profiles),
        )
        .unwrap();

    let err = engine
        .delete(&Dn::root(), &dn("uid=victim,dc=busy,dc=com"))
        .unwrap_err();
    assert_eq!(err.code, ResultCode::Busy);

    // The dependent was never touched: no rollback, no partial delete.
    assert!(mem.adapter().get(&profiles, &key).unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Proxy forwarding
// ---------------------------------------------------------------------------

const PROXY_PARTITION: &str = r#"
name = "proxied"

[[connections]]
name = "remote"
adapter = "memory"

[[entries]]
dn = "ou=Remote,dc=example,dc=com"
object_classes = ["organizationalUnit"]
[[entries.attributes]]
name = "ou"
rdn = true
value = { constant = "Remote" }
[entries.proxy]
connection = "remote"
remote_base_dn = "dc=backend,dc=net"
"#;

#[test]
fn proxy_rewrites_dns_both_ways() {
    let (_manager, engine) = engine_for(PROXY_PARTITION);
    let local = dn("cn=svc,ou=Remote,dc=example,dc=com");

    engine
        .add(
            &Dn::root(),
            &local,
            &attrs(&[("objectClass", "applicationProcess"), ("cn", "svc")]),
        )
        .unwrap();

    // The entry resolves under the local namespace...
    let found = engine.find_entry(&Dn::root(), &local).unwrap();
    assert_eq!(found.dn.to_string(), "cn=svc,ou=Remote,dc=example,dc=com");
    assert_eq!(found.attributes.value("cn"), Some("svc"));

    // ...and one-level searches under the proxy root pass through.
    let results = engine
        .search(
            &Dn::root(),
            &dn("ou=Remote,dc=example,dc=com"),
            SearchScope::One,
            Some(&Filter::eq("cn", "svc")),
            0,
        )
        .unwrap();
    assert_eq!(results.len(), 1);

    engine.delete(&Dn::root(), &local).unwrap();
    assert_eq!(
        engine.find_entry(&Dn::root(), &local).unwrap_err().code,
        ResultCode::NoSuchObject
    );
}

// ---------------------------------------------------------------------------
// Bind and access control
// ---------------------------------------------------------------------------

const BIND_PARTITION: &str = r#"
name = "auth"

[[connections]]
name = "mem"
adapter = "memory"

[[sources]]
name = "accounts"
connection = "mem"
fields = [
    { name = "uid", primary_key = true },
    { name = "password" },
]

[[entries]]
dn = "dc=auth,dc=com"
object_classes = ["dcObject"]
[[entries.attributes]]
name = "dc"
rdn = true
value = { constant = "auth" }

[[entries]]
dn = "uid=...,dc=auth,dc=com"
object_classes = ["account"]
[[entries.attributes]]
name = "uid"
rdn = true
value = { variable = "a.uid" }
[[entries.sources]]
alias = "a"
source = "accounts"
[[entries.sources.fields]]
name = "uid"
primary_key = true
value = { variable = "rdn.uid" }
"#;

#[test]
fn bind_checks_primary_source_credentials() {
    let (manager, engine) = engine_for(BIND_PARTITION);
    let partition = manager.partition("auth").unwrap();
    let accounts = partition.source_config("accounts").unwrap();
    partition
        .connection("mem")
        .unwrap()
        .adapter()
        .add(
            &accounts,
            &Row::keyed(attrs(&[("uid", "svc"), ("password", "hunter2")]), &accounts),
        )
        .unwrap();

    let target = dn("uid=svc,dc=auth,dc=com");
    engine.bind(&target, "hunter2").unwrap();

    let err = engine.bind(&target, "wrong").unwrap_err();
    assert_eq!(err.code, ResultCode::InvalidCredentials);

    let err = engine.bind(&dn("uid=ghost,dc=auth,dc=com"), "x").unwrap_err();
    assert_eq!(err.code, ResultCode::NoSuchObject);
}

#[test]
fn acl_denial_short_circuits_writes() {
    let acl = Arc::new(ReadOnlySubtrees::new(vec!["dc=example,dc=com".into()]));
    let (_manager, engine) = engine_with_acl(GROUPS_PARTITION, acl);

    let target = dn("cn=blocked,ou=Groups,dc=example,dc=com");
    let err = engine
        .add(&Dn::root(), &target, &attrs(&[("cn", "blocked")]))
        .unwrap_err();
    assert_eq!(err.code, ResultCode::InsufficientAccessRights);

    // Reads stay open.
    assert!(engine
        .search(&Dn::root(), &dn("dc=example,dc=com"), SearchScope::Base, None, 0)
        .is_ok());
}
