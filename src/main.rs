//! Stackwire CLI - compose a deployment and emit its manifest

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stackwire::compiler::{Deployment, DeploymentCompiler};
use stackwire::config::DeploymentConfig;
use stackwire::manifest::{Format, Manifest};
use stackwire::parameters::ParameterStore;

/// Stackwire - compose network, data, application and harness stacks
#[derive(Parser, Debug)]
#[command(name = "stackwire", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compose the deployment and print its manifest
    Synth(SynthArgs),

    /// Compose the deployment and print the apply waves
    Plan(ConfigArgs),

    /// Compose and validate the deployment without emitting anything
    Validate(ConfigArgs),

    /// Print the JSON schema of the deployment configuration
    Schema,
}

/// Arguments shared by every composing subcommand
#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Path to the deployment YAML file
    #[arg(short = 'f', long = "config", env = "STACKWIRE_CONFIG")]
    config_file: PathBuf,
}

/// Synth arguments
#[derive(Parser, Debug)]
struct SynthArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Manifest format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Write the manifest here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

impl From<OutputFormat> for Format {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => Format::Json,
            OutputFormat::Yaml => Format::Yaml,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the manifest on stdout stays machine readable
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Synth(args) => run_synth(args),
        Commands::Plan(args) => run_plan(&args.config_file),
        Commands::Validate(args) => run_validate(&args.config_file),
        Commands::Schema => {
            let schema = schemars::schema_for!(DeploymentConfig);
            let json = serde_json::to_string_pretty(&schema)
                .map_err(|e| anyhow::anyhow!("Failed to serialize schema: {}", e))?;
            println!("{json}");
            Ok(())
        }
    }
}

/// Load a configuration and compose it
fn compose(path: &Path) -> anyhow::Result<Deployment> {
    let config = DeploymentConfig::load(path).map_err(|e| anyhow::anyhow!("{}", e))?;
    let store = ParameterStore::new(config.parameters.clone());
    DeploymentCompiler::new(&config, &store)
        .compile()
        .map_err(|e| anyhow::anyhow!("Failed to compose {}: {}", config.name, e))
}

fn run_synth(args: SynthArgs) -> anyhow::Result<()> {
    let deployment = compose(&args.config.config_file)?;
    let manifest = Manifest::from_deployment(&deployment).map_err(|e| anyhow::anyhow!("{}", e))?;
    let rendered = manifest
        .render(args.format.into())
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, rendered)
                .map_err(|e| anyhow::anyhow!("Failed to write {:?}: {}", path, e))?;
            tracing::info!(path = %path.display(), resources = manifest.resource_count(), "manifest written");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn run_plan(path: &Path) -> anyhow::Result<()> {
    let deployment = compose(path)?;
    let waves = deployment
        .apply_waves()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    println!("=== {} ({}) ===", deployment.name(), deployment.environment());
    for (index, wave) in waves.iter().enumerate() {
        println!("wave {}:", index + 1);
        for id in wave {
            let explicit: Vec<String> = deployment
                .graph()
                .dependencies(id)
                .into_iter()
                .filter(|e| e.kind == stackwire::graph::EdgeKind::Explicit)
                .map(|e| e.producer.to_string())
                .collect();
            if explicit.is_empty() {
                println!("  {}", id);
            } else {
                println!("  {} (after {})", id, explicit.join(", "));
            }
        }
    }
    Ok(())
}

fn run_validate(path: &Path) -> anyhow::Result<()> {
    let deployment = compose(path)?;
    println!("=== {} ({}) is valid ===", deployment.name(), deployment.environment());
    for (stack, count) in deployment.summary() {
        println!("{:<24} {:>3} resources", stack, count);
    }
    println!(
        "{} grants, {} network rules, {} explicit edges",
        deployment.grants().len(),
        deployment.rules().len(),
        deployment.graph().explicit_edges().len()
    );
    if deployment.harness().is_none() {
        println!("test harness excluded (target is not experimental)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn synth_parses_format_and_output() {
        let cli = Cli::try_parse_from([
            "stackwire",
            "synth",
            "-f",
            "deploy.yaml",
            "--format",
            "yaml",
            "-o",
            "out.yaml",
        ])
        .unwrap();
        match cli.command {
            Commands::Synth(args) => {
                assert_eq!(args.config.config_file, PathBuf::from("deploy.yaml"));
                assert_eq!(Format::from(args.format), Format::Yaml);
                assert_eq!(args.output, Some(PathBuf::from("out.yaml")));
            }
            other => panic!("expected synth, got {:?}", other),
        }
    }

    #[test]
    fn synth_writes_the_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("deploy.yaml");
        std::fs::write(
            &config,
            "name: orders\napplication:\n  serviceName: orders\n  artifact:\n    buildContext:\n      directory: app\n",
        )
        .unwrap();
        let output = dir.path().join("manifest.json");

        run_synth(SynthArgs {
            config: ConfigArgs {
                config_file: config,
            },
            format: OutputFormat::Json,
            output: Some(output.clone()),
        })
        .unwrap();

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(output).unwrap()).unwrap();
        assert_eq!(manifest["deployment"], "orders");
        assert!(manifest["applyWaves"].as_array().unwrap().len() > 1);
    }

    #[test]
    fn missing_config_is_reported() {
        let err = compose(Path::new("/nonexistent/deploy.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
