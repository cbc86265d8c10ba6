//! Environment lifecycle commands.

use std::sync::Arc;

use crate::config::EnvironmentConfig;
use crate::engine::{ContainerEngine, DockerEngine};
use crate::environment::{Container, ContainerManager, Environment, Orchestrator};

async fn connect() -> anyhow::Result<Arc<dyn ContainerEngine>> {
    let engine = DockerEngine::connect().await?;
    Ok(Arc::new(engine))
}

fn describe(config: &EnvironmentConfig, env: &Environment) {
    println!("Environment ready on network '{}':", env.network.name);
    println!(
        "  {} ({}) -> 127.0.0.1:{}",
        env.dependency.name, env.dependency.id, config.db_port
    );
    println!(
        "  {} ({}) -> 127.0.0.1:{}",
        env.app.name, env.app.id, config.app_port
    );
}

/// Bring the environment up and leave it running.
pub async fn run_up_command(config: &EnvironmentConfig) -> anyhow::Result<()> {
    let engine = connect().await?;
    let mut orchestrator = Orchestrator::builder(engine, config.to_plan())
        .sink(config.output.sink())
        .dependency_probe(config.dependency_probe())
        .build();

    let env = orchestrator.bring_up().await.map_err(|e| {
        anyhow::anyhow!("{} stage failed for '{}': {}", e.stage(), e.resource(), e)
    })?;
    describe(config, &env);
    println!("Run 'testbed down' to stop it.");
    Ok(())
}

/// Run `command` against a fresh environment and return its exit code.
///
/// The environment is torn down whatever the command's outcome.
pub async fn run_test_command(
    config: &EnvironmentConfig,
    command: Vec<String>,
) -> anyhow::Result<i32> {
    let Some(program) = command.first().cloned() else {
        anyhow::bail!("No test command given");
    };

    let engine = connect().await?;
    let mut orchestrator = Orchestrator::builder(engine, config.to_plan())
        .sink(config.output.sink())
        .dependency_probe(config.dependency_probe())
        .build();

    let app_url = format!("http://127.0.0.1:{}", config.app_port);
    let (status, report) = orchestrator
        .run(|env| async move {
            tracing::info!("Running tests: {}", command.join(" "));
            tokio::process::Command::new(&command[0])
                .args(&command[1..])
                .env("TESTBED_APP_URL", &app_url)
                .env("TESTBED_NETWORK", &env.network.name)
                .status()
                .await
        })
        .await
        .map_err(|e| {
            anyhow::anyhow!("{} stage failed for '{}': {}", e.stage(), e.resource(), e)
        })?;

    if !report.is_clean() {
        eprintln!("Teardown finished with {} failure(s):", report.failures.len());
        for failure in &report.failures {
            eprintln!("  {}", failure);
        }
    }

    let status = status.map_err(|e| anyhow::anyhow!("Failed to run '{}': {}", program, e))?;
    // Killed by a signal: no code.
    Ok(status.code().unwrap_or(1))
}

/// Stop the environment's containers by name, without draining logs.
pub async fn run_down_command(config: &EnvironmentConfig) -> anyhow::Result<()> {
    let engine = connect().await?;
    let containers = ContainerManager::new(engine, config.output.sink())
        .with_stop_timeout(std::time::Duration::from_secs(config.stop_timeout_secs));

    let mut failures = 0;
    for name in [&config.app_name, &config.db_name] {
        let Some(id) = containers.lookup(name).await? else {
            println!("  {} not found", name);
            continue;
        };
        let container = Container {
            id,
            name: name.clone(),
        };

        let mut result = containers.stop(&container, false).await;
        if result.is_ok() && !config.keep_containers {
            result = containers.remove(&container).await;
        }

        match result {
            Ok(()) => println!("  {} stopped", name),
            Err(e) => {
                tracing::warn!("Teardown: {}", e);
                println!("  {} failed: {}", name, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} container(s) could not be stopped", failures);
    }
    Ok(())
}
