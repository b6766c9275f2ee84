use std::{env, sync::Arc};

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::{Api, PostParams},
    runtime::controller::{Action, Controller},
    runtime::watcher,
    Client, CustomResourceExt,
};
use kube_core::ErrorResponse;
use thiserror::Error;
use tracing::*;

use migration_controller::context::{Context, DEFAULT_MAX_IN_FLIGHT};
use migration_controller::inventory::InventoryClient;
use migration_controller::migration::{self, EngineError};
use migration_controller::plan_types::{Migration, Plan};
use migration_controller::store::KubeStore;
use migration_controller::vmimport_types::VirtualMachineImport;

#[derive(Debug, Error)]
enum Error {
    #[error("Failed to get Migration: {0}")]
    MigrationGetFailed(#[source] kube::Error),
    #[error("Failed to get Plan: {0}")]
    PlanGetFailed(#[source] kube::Error),
    #[error("Migration run failed: {0}")]
    RunFailed(#[source] EngineError),
    #[error("Failed to update Plan status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error("Failed to serialize Plan: {0}")]
    SerializeFailed(#[from] serde_json::Error),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

// Data we want access to in error/reconcile calls
struct Data {
    client: Client,
    inventory_url: String,
    max_in_flight: usize,
}

/// Controller triggers this whenever a Migration or its plan changed,
/// and again after the requeue delay the engine asks for.
async fn reconcile(migration_from_cache: Arc<Migration>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;

    let name = migration_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.name"))?;
    let namespace = migration_from_cache
        .metadata
        .namespace
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;

    let migration_api = Api::<Migration>::namespaced(client.clone(), namespace);

    // Get the Migration before taking any reconciliation actions.
    let get_result = migration_api.get(name).await;
    let migration = match get_result {
        Err(kube::Error::Api(ErrorResponse { ref reason, .. })) if reason == "NotFound" => {
            info!("{} not found, end reconcile", name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::MigrationGetFailed(e)),
        Ok(migration) => migration,
    };

    let plan_ref = migration.spec.plan.clone();
    let plan_namespace = if plan_ref.namespace.is_empty() {
        namespace.clone()
    } else {
        plan_ref.namespace.clone()
    };
    let plan_api = Api::<Plan>::namespaced(client.clone(), &plan_namespace);
    let mut plan = plan_api
        .get(&plan_ref.name)
        .await
        .map_err(Error::PlanGetFailed)?;

    let inventory = Arc::new(InventoryClient::new(
        ctx.inventory_url.clone(),
        plan.spec.provider.source.clone(),
    ));
    let store = Arc::new(KubeStore::new(client.clone()));
    let context =
        Context::new(&plan, migration, inventory, store).with_max_in_flight(ctx.max_in_flight);

    let mut engine = migration::Migration::new(context);
    let requeue = engine.run(&mut plan).await.map_err(Error::RunFailed)?;

    // The engine mutates the plan in memory; persist its status.
    let data = serde_json::to_vec(&plan)?;
    plan_api
        .replace_status(&plan_ref.name, &PostParams::default(), data)
        .await
        .map_err(Error::StatusUpdateFailed)?;

    match requeue {
        Some(delay) => Ok(Action::requeue(delay)),
        None => {
            info!("plan {} finalized", plan_ref.name);
            Ok(Action::await_change())
        }
    }
}

/// The controller triggers this on reconcile errors
fn error_policy(_object: Arc<Migration>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(migration::POLL_REQUEUE)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).cloned().unwrap_or_default();
    if cmd == "export" {
        info!("exporting custom resource definitions");
        println!("{}", serde_yaml::to_string(&Plan::crd())?);
        println!("---");
        println!("{}", serde_yaml::to_string(&Migration::crd())?);
        println!("---");
        println!("{}", serde_yaml::to_string(&VirtualMachineImport::crd())?);
    } else if cmd == "run" {
        info!("running migration-controller");
        let inventory_url =
            env::var("INVENTORY_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        let max_in_flight = env::var("MAX_VM_INFLIGHT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_IN_FLIGHT);
        let client = Client::try_default().await?;
        let migrations = Api::<Migration>::all(client.clone());

        Controller::new(migrations, watcher::Config::default())
            .shutdown_on_signal()
            .run(
                reconcile,
                error_policy,
                Arc::new(Data { client, inventory_url, max_in_flight }),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
