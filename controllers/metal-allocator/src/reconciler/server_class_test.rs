//! Unit tests for the ServerClass reconciler

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::reconciler::ReconcileOutcome;
    use crate::test_utils::*;
    use crds::*;
    use metal_store::{MockMetalStore, MockWorkloadClient};

    #[tokio::test]
    async fn test_status_splits_available_and_in_use() {
        let store = MockMetalStore::new();
        store.add_server(with_cpu(create_test_server("srv-a", true), "AMD", "EPYC"));
        store.add_server(with_status(
            with_cpu(create_test_server("srv-b", true), "AMD", "EPYC"),
            true,
            true,
        ));
        store.add_server(with_cpu(create_test_server("srv-c", true), "Intel(R) Corporation", "Xeon"));
        store.add_server(with_cpu(create_test_server("srv-d", false), "AMD", "EPYC"));
        let spec = ServerClassSpec {
            qualifiers: Qualifiers {
                cpu: vec![CPUInformation {
                    manufacturer: "AMD".to_string(),
                    version: String::new(),
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let class = ServerClass::new("amd", spec);
        store.add_server_class(class.clone());
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let outcome = reconciler.reconcile_server_class(&class).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);

        let status = store.server_class("amd").unwrap().status.unwrap();
        assert_eq!(status.servers_available, vec!["srv-a"]);
        assert_eq!(status.servers_in_use, vec!["srv-b"]);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_rewritten() {
        let store = MockMetalStore::new();
        store.add_server(create_test_server("srv-a", true));
        let class = create_test_server_class("all", ServerClassSpec::default(), &["srv-a"]);
        store.add_server_class(class.clone());
        let version = store.server_class("all").unwrap().metadata.resource_version;
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        reconciler.reconcile_server_class(&class).await.unwrap();
        assert_eq!(store.server_class("all").unwrap().metadata.resource_version, version);
    }

    #[tokio::test]
    async fn test_any_class_is_created_and_kept_unrestricted() {
        let store = MockMetalStore::new();
        store.add_server(create_test_server("srv-a", true));
        store.add_server(with_labels(create_test_server("srv-b", true), &[("rack", "r1")]));
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        reconciler.ensure_server_class_any().await.unwrap();
        // Creating twice is fine
        reconciler.ensure_server_class_any().await.unwrap();

        // Someone adds a restriction to the built-in class
        let mut any = store.server_class(SERVER_CLASS_ANY).unwrap();
        any.spec.qualifiers.label_selectors =
            vec![std::collections::BTreeMap::from([("rack".to_string(), "r1".to_string())])];
        store.add_server_class(any.clone());

        reconciler.reconcile_server_class(&any).await.unwrap();

        let any = store.server_class(SERVER_CLASS_ANY).unwrap();
        assert!(any.spec.qualifiers.is_empty());
        assert!(any.spec.selector.is_none());
        assert_eq!(any.status.unwrap().servers_available, vec!["srv-a", "srv-b"]);
    }

    #[tokio::test]
    async fn test_malformed_selector_fails_reconcile() {
        let store = MockMetalStore::new();
        store.add_server(create_test_server("srv-a", true));
        let class = ServerClass::new(
            "broken",
            ServerClassSpec {
                selector: Some(LabelSelector {
                    match_expressions: vec![LabelSelectorRequirement {
                        key: "tier".to_string(),
                        operator: "Gt".to_string(),
                        values: vec!["1".to_string()],
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        store.add_server_class(class.clone());
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        let err = reconciler.reconcile_server_class(&class).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSelector(_)));
        assert!(store.server_class("broken").unwrap().status.is_none());
    }

    #[tokio::test]
    async fn test_startup_reconciliation_builds_index() {
        let store = MockMetalStore::new();
        store.add_server_binding(create_test_binding("srv-a", "default", "m1"));
        let mut machine = create_test_metal_machine("default", "m1", None);
        machine.spec.server_ref = Some(ResourceReference::new("srv-a"));
        store.add_metal_machine(machine);
        let reconciler = create_test_reconciler(store.clone(), MockWorkloadClient::new());

        reconciler.startup_reconciliation().await.unwrap();

        assert!(store.server_class(SERVER_CLASS_ANY).is_some());
        let key = ObjectKey::new("default", "m1");
        assert_eq!(reconciler.index().bindings_for_machine(&key), vec!["srv-a"]);
        assert_eq!(reconciler.index().machines_for_server("srv-a"), vec![key]);
    }
}
