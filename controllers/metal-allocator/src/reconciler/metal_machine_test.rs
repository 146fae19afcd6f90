//! Unit tests for the MetalMachine reconciler

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::reconciler::{ReconcileOutcome, WaitReason};
    use crate::test_utils::*;
    use crds::conditions::{self, PROVIDER_SET_CONDITION, PROVIDER_UPDATE_FAILED_REASON};
    use crds::*;
    use metal_store::{MetalStore, MockMetalStore, MockWorkloadClient, StoreError};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    /// A store with one ready owner per machine and a class listing `pool`
    fn setup(machines: &[&str], pool: &[&str]) -> MockMetalStore {
        let store = MockMetalStore::new();
        for server in pool {
            store.add_server(create_test_server(server, true));
        }
        store.add_server_class(create_test_server_class("large", ServerClassSpec::default(), pool));
        for name in machines {
            let machine = create_test_metal_machine("default", name, Some("large"));
            add_ready_owner(&store, &machine, "prod");
            store.add_metal_machine(machine);
        }
        store
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    fn mark_deleting(machine: &mut MetalMachine) {
        machine.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2026-10-15T00:00:00Z")).unwrap());
    }

    #[tokio::test]
    async fn test_allocates_from_class_and_becomes_ready() {
        let store = setup(&["m1"], &["srv-a"]);
        let workload = MockWorkloadClient::new();
        workload.add_node("srv-a");
        let reconciler = create_test_reconciler(store.clone(), workload.clone());
        let machine = store.metal_machine(&key("m1")).unwrap();

        // Claimed, but the binding is not confirmed yet
        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(WaitReason::BindingNotReady));

        let claimed = store.metal_machine(&key("m1")).unwrap();
        assert!(claimed.has_finalizer());
        assert_eq!(claimed.spec.server_ref.as_ref().map(|r| r.name.as_str()), Some("srv-a"));
        assert_eq!(claimed.spec.provider_id.as_deref(), Some("metal://srv-a"));
        assert!(!claimed.status.as_ref().is_some_and(|s| s.ready));

        let binding = store.get_server_binding("srv-a").await.unwrap();
        assert!(binding.spec.metal_machine_ref.points_to(&key("m1")));
        assert_eq!(binding.spec.server_class_ref.map(|r| r.name).as_deref(), Some("large"));
        assert_eq!(reconciler.metrics().allocations.get(), 1);

        let binding = store.get_server_binding("srv-a").await.unwrap();
        reconciler.reconcile_server_binding(&binding).await.unwrap();

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);

        let ready = store.metal_machine(&key("m1")).unwrap();
        let status = ready.status.unwrap();
        assert!(status.ready);
        assert!(conditions::is_true(&status.conditions, PROVIDER_SET_CONDITION));
        assert_eq!(workload.provider_id("srv-a").as_deref(), Some("metal://srv-a"));
        assert_eq!(store.binding_creates(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocators_never_double_claim() {
        let machines = ["m1", "m2", "m3", "m4", "m5", "m6"];
        let store = setup(&machines, &["srv-a", "srv-b"]);

        let mut handles = Vec::new();
        for name in machines {
            // One reconciler per machine, each with its own cache, sharing the store
            let reconciler = Arc::new(create_test_reconciler(store.clone(), MockWorkloadClient::new()));
            let machine = store.metal_machine(&key(name)).unwrap();
            handles.push(tokio::spawn(async move {
                reconciler.reconcile_metal_machine(&machine).await
            }));
        }

        let mut waiting = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ReconcileOutcome::Requeue(WaitReason::NoEligibleServers) => waiting += 1,
                ReconcileOutcome::Requeue(WaitReason::BindingNotReady) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(waiting, 4);

        let bindings = store.server_bindings();
        assert_eq!(bindings.len(), 2);
        let owners: BTreeSet<ObjectKey> =
            bindings.iter().map(|b| b.spec.metal_machine_ref.key()).collect();
        assert_eq!(owners.len(), 2, "each binding belongs to a different machine");

        let referencing: Vec<String> = machines
            .iter()
            .filter_map(|name| store.metal_machine(&key(name)))
            .filter_map(|m| m.spec.server_ref.map(|r| r.name))
            .collect();
        let unique: BTreeSet<&String> = referencing.iter().collect();
        assert_eq!(referencing.len(), 2);
        assert_eq!(unique.len(), 2, "no server referenced by two machines");
    }

    #[tokio::test]
    async fn test_adopts_existing_binding_instead_of_claiming_again() {
        let store = setup(&["m1"], &["srv-a", "srv-b"]);
        // Binding from an earlier pass whose MetalMachine write was lost
        store.add_server_binding(create_test_binding("srv-b", "default", "m1"));
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());
        let machine = store.metal_machine(&key("m1")).unwrap();

        reconciler.reconcile_metal_machine(&machine).await.unwrap();

        let adopted = store.metal_machine(&key("m1")).unwrap();
        assert_eq!(adopted.spec.server_ref.map(|r| r.name).as_deref(), Some("srv-b"));
        assert_eq!(store.binding_creates(), 0);
        assert_eq!(store.server_bindings().len(), 1);
    }

    #[tokio::test]
    async fn test_skips_servers_in_use_or_unclean() {
        let store = setup(&["m1"], &["srv-a", "srv-b", "srv-c"]);
        store.add_server(with_status(create_test_server("srv-a", true), true, true));
        store.add_server(with_status(create_test_server("srv-b", true), false, false));
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());
        let machine = store.metal_machine(&key("m1")).unwrap();

        reconciler.reconcile_metal_machine(&machine).await.unwrap();

        let names: Vec<String> = store.server_bindings().iter().filter_map(|b| b.metadata.name.clone()).collect();
        assert_eq!(names, vec!["srv-c"]);
    }

    #[tokio::test]
    async fn test_no_eligible_servers_waits() {
        let store = setup(&["m1"], &["srv-a"]);
        store.add_server_binding(create_test_binding("srv-a", "default", "other"));
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());
        let machine = store.metal_machine(&key("m1")).unwrap();

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(WaitReason::NoEligibleServers));
        assert_eq!(reconciler.metrics().claim_conflicts.get(), 1);
        assert_eq!(reconciler.metrics().no_eligible_servers.get(), 1);

        let waiting = store.metal_machine(&key("m1")).unwrap();
        assert!(waiting.spec.server_ref.is_none());
        // The finalizer is committed even though allocation did not finish
        assert!(waiting.has_finalizer());
    }

    #[tokio::test]
    async fn test_unexpected_create_error_aborts_allocation() {
        let store = setup(&["m1"], &["srv-a", "srv-b"]);
        store.fail_binding_creates("admission webhook denied the request");
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());
        let machine = store.metal_machine(&key("m1")).unwrap();

        let err = reconciler.reconcile_metal_machine(&machine).await.unwrap_err();
        assert!(matches!(err, ControllerError::Store(StoreError::InvalidRequest(_))));
        assert!(store.server_bindings().is_empty());
        assert!(store.metal_machine(&key("m1")).unwrap().has_finalizer());
    }

    #[tokio::test]
    async fn test_missing_server_and_class_is_terminal() {
        let store = MockMetalStore::new();
        let machine = create_test_metal_machine("default", "m1", None);
        add_ready_owner(&store, &machine, "prod");
        store.add_metal_machine(machine.clone());
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);

        let status = store.metal_machine(&key("m1")).unwrap().status.unwrap();
        assert_eq!(status.failure_reason.as_deref(), Some(INVALID_CONFIGURATION_REASON));
        assert!(status.failure_message.is_some());
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_waits_for_owner_and_cluster() {
        let store = MockMetalStore::new();
        let machine = create_test_metal_machine("default", "m1", Some("large"));
        store.add_metal_machine(machine.clone());
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(WaitReason::OwnerMachineMissing));

        add_ready_owner(&store, &machine, "prod");
        let mut paused = Cluster::new("prod", ClusterSpec { paused: true });
        paused.metadata.namespace = Some("default".to_string());
        store.add_cluster(paused);

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(WaitReason::ClusterPaused));
        // Nothing is written while gated
        assert!(!store.metal_machine(&key("m1")).unwrap().has_finalizer());
    }

    #[tokio::test]
    async fn test_deletion_releases_only_own_bindings() {
        let store = setup(&["m1"], &["srv-a"]);
        let mut machine = store.metal_machine(&key("m1")).unwrap();
        machine.add_finalizer();
        machine.spec.server_ref = Some(ResourceReference::new("srv-a"));
        mark_deleting(&mut machine);
        store.add_metal_machine(machine.clone());
        store.add_server_binding(create_test_binding("srv-a", "default", "m1"));
        store.add_server_binding(create_test_binding("srv-x", "default", "other"));
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(WaitReason::BindingReleasing));
        let remaining: Vec<String> = store.server_bindings().iter().filter_map(|b| b.metadata.name.clone()).collect();
        assert_eq!(remaining, vec!["srv-x"]);
        assert!(store.metal_machine(&key("m1")).unwrap().has_finalizer());

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert!(store.metal_machine(&key("m1")).is_none(), "finalizer released");

        // Repeating the release is a no-op
        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(store.server_bindings().len(), 1);
    }

    #[tokio::test]
    async fn test_deletion_proceeds_while_owner_missing() {
        let store = MockMetalStore::new();
        let mut machine = create_test_metal_machine("default", "m1", Some("large"));
        machine.add_finalizer();
        mark_deleting(&mut machine);
        store.add_metal_machine(machine.clone());
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert!(store.metal_machine(&key("m1")).is_none());
    }

    #[tokio::test]
    async fn test_provider_id_failure_sets_condition_and_waits() {
        let store = setup(&["m1"], &["srv-a"]);
        let mut binding = create_test_binding("srv-a", "default", "m1");
        binding.spec.addresses = vec!["10.0.0.5".to_string()];
        binding.spec.hostname = Some("node-a".to_string());
        binding.status = Some(ServerBindingStatus {
            ready: true,
            conditions: Vec::new(),
        });
        store.add_server_binding(binding);
        let mut machine = store.metal_machine(&key("m1")).unwrap();
        machine.spec.server_ref = Some(ResourceReference::new("srv-a"));
        store.add_metal_machine(machine.clone());
        // Workload cluster has no node for srv-a
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(WaitReason::ProviderIdNotSet));

        let status = store.metal_machine(&key("m1")).unwrap().status.unwrap();
        assert!(status.ready);
        assert_eq!(
            status.addresses,
            vec![
                MachineAddress {
                    type_: MachineAddressType::InternalIp,
                    address: "10.0.0.5".to_string(),
                },
                MachineAddress {
                    type_: MachineAddressType::Hostname,
                    address: "node-a".to_string(),
                },
            ]
        );
        let condition = conditions::find(&status.conditions, PROVIDER_SET_CONDITION).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason.as_deref(), Some(PROVIDER_UPDATE_FAILED_REASON));
        assert_eq!(condition.severity, Some(ConditionSeverity::Warning));
    }

    #[tokio::test]
    async fn test_direct_reference_to_unaccepted_server_fails() {
        let store = setup(&["m1"], &[]);
        store.add_server(create_test_server("srv-new", false));
        let mut machine = store.metal_machine(&key("m1")).unwrap();
        machine.spec.server_ref = Some(ResourceReference::new("srv-new"));
        store.add_metal_machine(machine.clone());
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let err = reconciler.reconcile_metal_machine(&machine).await.unwrap_err();
        assert!(matches!(err, ControllerError::ServerNotAccepted(_)));
        assert!(store.server_bindings().is_empty());
    }

    #[tokio::test]
    async fn test_direct_reference_creates_binding() {
        let store = setup(&["m1"], &[]);
        store.add_server(create_test_server("srv-d", true));
        let mut machine = store.metal_machine(&key("m1")).unwrap();
        machine.spec.server_ref = Some(ResourceReference::new("srv-d"));
        store.add_metal_machine(machine.clone());
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let outcome = reconciler.reconcile_metal_machine(&machine).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(WaitReason::BindingNotVisible));

        let binding = store.get_server_binding("srv-d").await.unwrap();
        assert!(binding.spec.metal_machine_ref.points_to(&key("m1")));
    }

    #[tokio::test]
    async fn test_direct_reference_to_server_bound_elsewhere_fails() {
        let store = setup(&["m1"], &[]);
        store.add_server(create_test_server("srv-d", true));
        store.add_server_binding(create_test_binding("srv-d", "default", "other"));
        let mut machine = store.metal_machine(&key("m1")).unwrap();
        machine.spec.server_ref = Some(ResourceReference::new("srv-d"));
        store.add_metal_machine(machine.clone());
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let err = reconciler.reconcile_metal_machine(&machine).await.unwrap_err();
        assert!(matches!(err, ControllerError::ServerAlreadyClaimed(_)));
    }
}
