//! End-to-end composition tests
//!
//! Compose whole deployment units from YAML and check the properties that
//! only hold across stacks: the orders scenario, idempotence, and the
//! independence of seeding from compute.

use std::collections::BTreeSet;

use stackwire::compiler::{Deployment, DeploymentCompiler};
use stackwire::config::DeploymentConfig;
use stackwire::grant::GrantAction;
use stackwire::handle::ResourceId;
use stackwire::manifest::{Format, Manifest};
use stackwire::parameters::ParameterStore;
use stackwire::policy::{Endpoint, Protocol};
use stackwire::resource::{ResourceKind, ResourceSpec};

const ORDERS: &str = r#"
name: orders
target:
  environment: dev
  experimental: true
application:
  serviceName: orders
  artifact:
    buildContext:
      directory: springboot-app
  seed:
    source: seed-data
    prefix: sql/
"#;

fn compose(yaml: &str) -> Deployment {
    let config = DeploymentConfig::from_yaml(yaml).unwrap();
    let store = ParameterStore::new(config.parameters.clone());
    DeploymentCompiler::new(&config, &store).compile().unwrap()
}

// =============================================================================
// Story: The Orders Service
// =============================================================================

#[test]
fn story_orders_service_composes_with_one_of_everything() {
    let deployment = compose(ORDERS);
    let app = deployment.stack("orders-app").unwrap();

    assert_eq!(app.count(ResourceKind::ContainerCluster), 1);
    assert_eq!(app.count(ResourceKind::Service), 1);
    assert_eq!(app.count(ResourceKind::Listener), 1);
    assert_eq!(app.count(ResourceKind::TargetGroup), 1);

    let listener = deployment.resource(&deployment.application().listener).unwrap();
    match &listener.spec {
        ResourceSpec::Listener { port, .. } => assert_eq!(*port, 80),
        other => panic!("expected a listener, got {:?}", other),
    }

    let probe = app
        .resources()
        .find_map(|r| match &r.spec {
            ResourceSpec::TargetGroup { health_check, .. } => Some(health_check.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(probe.port, 8081);
    assert_ne!(probe.port, 80);
}

#[test]
fn story_task_identity_holds_exactly_one_decrypt() {
    let deployment = compose(ORDERS);
    let identity = &deployment.application().task_identity.id;
    let grants = deployment.grants();

    let decrypts: Vec<_> = grants
        .for_principal(identity)
        .filter(|g| g.action == GrantAction::Decrypt)
        .collect();
    assert_eq!(decrypts.len(), 1);
    assert_eq!(decrypts[0].resource.to_string(), "orders-foundation/Key");
    assert_eq!(
        grants.actions_for(identity),
        BTreeSet::from([GrantAction::Pull, GrantAction::Decrypt, GrantAction::Read])
    );
}

#[test]
fn story_service_reaches_database_on_its_port_only() {
    let deployment = compose(ORDERS);
    let service = Endpoint::Boundary(deployment.application().service_boundary.id.clone());
    let database = Endpoint::Boundary(ResourceId::new("orders-data", "DatabaseBoundary"));
    let policy = deployment.policy();

    assert!(policy.permits(&service, &database, Protocol::Tcp, 5432));
    assert!(!policy.permits(&service, &database, Protocol::Tcp, 3306));

    let to_database: Vec<_> = deployment
        .rules()
        .into_iter()
        .filter(|r| r.from == service && r.to == database)
        .collect();
    assert_eq!(to_database.len(), 1);
    assert!(to_database[0].port.contains(Protocol::Tcp, 5432));
}

// =============================================================================
// Story: Idempotent Composition
// =============================================================================

#[test]
fn story_composing_twice_yields_identical_declarations() {
    let first = compose(ORDERS);
    let second = compose(ORDERS);

    assert_eq!(first.stacks(), second.stacks());
    assert_eq!(first.grants(), second.grants());
    assert_eq!(first.rules(), second.rules());

    let ids: Vec<_> = first.resources().map(|r| r.id.clone()).collect();
    let unique: BTreeSet<_> = ids.iter().cloned().collect();
    assert_eq!(ids.len(), unique.len(), "duplicate declarations");

    for format in [Format::Json, Format::Yaml] {
        let a = Manifest::from_deployment(&first).unwrap().render(format).unwrap();
        let b = Manifest::from_deployment(&second).unwrap().render(format).unwrap();
        assert_eq!(a, b);
    }
}

// =============================================================================
// Story: Seeding Is Independent Of Compute
// =============================================================================

#[test]
fn story_removing_the_seed_still_composes() {
    let unseeded = ORDERS.replace("  seed:\n    source: seed-data\n    prefix: sql/\n", "");
    let seeded = compose(ORDERS);
    let plain = compose(&unseeded);

    assert!(plain.application().seed.is_none());
    assert_eq!(
        seeded.graph().explicit_edges().len(),
        plain.graph().explicit_edges().len() + 1
    );
    assert_eq!(plain.count(ResourceKind::BucketDeployment), 0);
    assert_eq!(seeded.count(ResourceKind::BucketDeployment), 1);

    // Compute declarations do not change with seeding
    let service = &plain.application().service;
    assert_eq!(
        plain.resource(service).unwrap().spec,
        seeded.resource(service).unwrap().spec
    );
}

#[test]
fn story_every_resource_is_applied_exactly_once() {
    let deployment = compose(ORDERS);
    let waves = deployment.apply_waves().unwrap();
    let applied: Vec<_> = waves.iter().flatten().collect();
    assert_eq!(applied.len(), deployment.resources().count());

    for (index, wave) in waves.iter().enumerate() {
        for id in wave {
            for edge in deployment.graph().dependencies(id) {
                let producer_wave = waves.iter().position(|w| w.contains(&edge.producer)).unwrap();
                assert!(producer_wave < index, "{} before {}", edge.producer, id);
            }
        }
    }
}
