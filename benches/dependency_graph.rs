//! Criterion benchmarks for DependencyGraph and deployment composition
//!
//! Graph construction and wave layering run once per compile; these measure
//! how they scale with the number of declared resources.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use stackwire::compiler::DeploymentCompiler;
use stackwire::config::DeploymentConfig;
use stackwire::graph::DependencyGraph;
use stackwire::handle::ResourceId;
use stackwire::parameters::ParameterStore;
use stackwire::resource::{Resource, ResourceSpec};

// =============================================================================
// Test Fixtures
// =============================================================================

fn key(stack: &str, n: usize) -> Resource {
    Resource::new(
        ResourceId::new(stack, &format!("Key{n}")),
        ResourceSpec::Key {
            alias: format!("alias/{stack}-{n}"),
            enable_rotation: true,
        },
    )
}

fn secret(stack: &str, n: usize, key: &ResourceId) -> Resource {
    Resource::new(
        ResourceId::new(stack, &format!("Secret{n}")),
        ResourceSpec::Secret {
            name: format!("{stack}/secret-{n}"),
            encryption_key: Some(key.clone()),
        },
    )
}

/// One key shared by `n` secrets
fn star(n: usize) -> Vec<Resource> {
    let hub = key("star", 0);
    let mut resources: Vec<Resource> = (0..n).map(|i| secret("star", i, &hub.id)).collect();
    resources.push(hub);
    resources
}

/// `n` independent key/secret pairs with each secret explicitly ordered
/// after the previous one
fn chain(n: usize) -> Vec<Resource> {
    let mut resources = Vec::with_capacity(n * 2);
    let mut previous: Option<ResourceId> = None;
    for i in 0..n {
        let k = key("chain", i);
        let mut s = secret("chain", i, &k.id);
        if let Some(p) = previous.take() {
            s.explicit_dependencies.insert(p);
        }
        previous = Some(s.id.clone());
        resources.push(k);
        resources.push(s);
    }
    resources
}

const DEPLOYMENT: &str = r#"
name: bench
target:
  experimental: true
application:
  serviceName: bench
  artifact:
    buildContext:
      directory: app
  seed:
    source: sql
"#;

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_from_resources(c: &mut Criterion) {
    let mut group = c.benchmark_group("from_resources");

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        let resources = star(size);
        group.bench_with_input(BenchmarkId::new("star", size), &resources, |b, resources| {
            b.iter(|| black_box(DependencyGraph::from_resources(resources.iter())))
        });
        let resources = chain(size);
        group.bench_with_input(BenchmarkId::new("chain", size), &resources, |b, resources| {
            b.iter(|| black_box(DependencyGraph::from_resources(resources.iter())))
        });
    }
    group.finish();
}

fn bench_apply_waves(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_waves");

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        let graph = DependencyGraph::from_resources(star(size).iter());
        group.bench_with_input(BenchmarkId::new("star", size), &graph, |b, graph| {
            b.iter(|| black_box(graph.apply_waves()))
        });
        let graph = DependencyGraph::from_resources(chain(size).iter());
        group.bench_with_input(BenchmarkId::new("chain", size), &graph, |b, graph| {
            b.iter(|| black_box(graph.apply_waves()))
        });
    }
    group.finish();
}

fn bench_find_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_cycle");

    for size in [100, 1000] {
        let graph = DependencyGraph::from_resources(chain(size).iter());
        group.bench_with_input(BenchmarkId::new("acyclic_chain", size), &graph, |b, graph| {
            b.iter(|| black_box(graph.find_cycle()))
        });
    }
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let config = DeploymentConfig::from_yaml(DEPLOYMENT).expect("bench config parses");
    let store = ParameterStore::new(config.parameters.clone());

    c.bench_function("compile_deployment", |b| {
        b.iter(|| black_box(DeploymentCompiler::new(&config, &store).compile()))
    });
}

criterion_group!(
    benches,
    bench_from_resources,
    bench_apply_waves,
    bench_find_cycle,
    bench_compile
);
criterion_main!(benches);
