//! Tests for nodes, the service registry and configuration

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use easel::{
        Config, EaselError, ErrorKind, Node, NodeBuilder, RecoveryPolicy, ServiceKind, ServiceName,
    };
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config::default().with_root_dir(dir.path())
    }

    fn test_node(config: &Config) -> Node {
        NodeBuilder::new()
            .config(config)
            .signal_handling(false)
            .create()
            .unwrap()
    }

    fn name(s: &str) -> ServiceName {
        ServiceName::new(s).unwrap()
    }

    #[test]
    fn test_config_from_toml() {
        let config = Config::from_toml_str(
            r#"
            [global]
            prefix = "test_"
            recovery_policy = "reject_stale"
            init_timeout = 250
            max_services = 16

            [defaults.publish_subscribe]
            pool_capacity = 64
            subscriber_max_buffer_size = 4

            [defaults.event]
            event_id_max_value = 1023

            [node]
            shutdown_signals = ["SIGUSR1"]
            shutdown_check_interval = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.global.prefix, "test_");
        assert_eq!(config.global.recovery_policy, RecoveryPolicy::RejectStale);
        assert_eq!(config.global.init_timeout, Duration::from_millis(250));
        assert_eq!(config.global.max_services, 16);
        assert_eq!(config.defaults.publish_subscribe.pool_capacity, 64);
        assert_eq!(config.defaults.publish_subscribe.subscriber_max_buffer_size, 4);
        // untouched keys keep their defaults
        assert_eq!(config.defaults.publish_subscribe.max_publishers, 4);
        assert_eq!(config.defaults.event.event_id_max_value, 1023);
        assert_eq!(config.node.shutdown_check_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        assert!(Config::from_toml_str("[global]\nmax_services = 0").is_err());
        assert!(Config::from_toml_str("[node]\nshutdown_signals = [\"SIGNOPE\"]").is_err());
        assert!(matches!(
            Config::from_toml_str("[global\nprefix = 1"),
            Err(EaselError::Config { .. })
        ));
    }

    #[test]
    fn test_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("easel.toml");
        std::fs::write(&path, "[defaults.event]\nmax_listeners = 2\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.defaults.event.max_listeners, 2);
        assert!(Config::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_node_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.defaults.publish_subscribe.pool_capacity = 0;

        let result = NodeBuilder::new()
            .config(&config)
            .signal_handling(false)
            .create();
        assert!(matches!(result, Err(EaselError::InvalidParameter { .. })));
    }

    #[test]
    fn test_service_discovery() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let node = test_node(&config);
        let observer = test_node(&config);

        assert!(observer.list_services().unwrap().is_empty());
        assert!(!observer.service_exists(&name("discovery/data")).unwrap());

        let _data = node
            .service_builder(&name("discovery/data"))
            .publish_subscribe::<u32>()
            .create()
            .unwrap();
        let _wakeup = node
            .service_builder(&name("discovery/wakeup"))
            .event()
            .create()
            .unwrap();

        assert!(observer.service_exists(&name("discovery/data")).unwrap());
        let details = observer
            .service_details(&name("discovery/wakeup"))
            .unwrap()
            .unwrap();
        assert_eq!(details.kind(), Some(ServiceKind::Event));

        let mut names: Vec<String> = observer
            .list_services()
            .unwrap()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["discovery/data", "discovery/wakeup"]);
    }

    #[test]
    fn test_open_modes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let first = test_node(&config);
        let second = test_node(&config);

        assert!(matches!(
            first
                .service_builder(&name("modes"))
                .publish_subscribe::<u64>()
                .open(),
            Err(EaselError::ServiceNotFound { .. })
        ));

        let _service = first
            .service_builder(&name("modes"))
            .publish_subscribe::<u64>()
            .create()
            .unwrap();

        let err = second
            .service_builder(&name("modes"))
            .publish_subscribe::<u64>()
            .create()
            .unwrap_err();
        assert!(matches!(err, EaselError::ServiceAlreadyExists { .. }));
        assert_eq!(err.kind(), ErrorKind::Compatibility);

        assert!(second
            .service_builder(&name("modes"))
            .publish_subscribe::<u64>()
            .open()
            .is_ok());
    }

    #[test]
    fn test_service_removed_after_last_handle() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let first = test_node(&config);
        let second = test_node(&config);

        first
            .service_builder(&name("lifetime"))
            .event()
            .create()
            .unwrap();
        second
            .service_builder(&name("lifetime"))
            .event()
            .open()
            .unwrap();

        drop(first);
        assert!(second.service_exists(&name("lifetime")).unwrap());
        drop(second);

        let third = test_node(&config);
        assert!(!third.service_exists(&name("lifetime")).unwrap());
        // the name can be reused for another pattern
        assert!(third
            .service_builder(&name("lifetime"))
            .publish_subscribe::<u8>()
            .create()
            .is_ok());
    }

    #[test]
    fn test_registry_full() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.global.max_services = 2;
        let node = test_node(&config);

        node.service_builder(&name("a")).event().create().unwrap();
        node.service_builder(&name("b")).event().create().unwrap();
        let err = node.service_builder(&name("c")).event().create().unwrap_err();
        assert!(matches!(err, EaselError::RegistryFull { capacity: 2 }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_released_entries_serve_new_names() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.global.max_services = 2;

        for service in ["a", "b", "c", "d", "e"] {
            let node = test_node(&config);
            node.service_builder(&name(service)).event().create().unwrap();
            node.service_builder(&name(&format!("{}/data", service)))
                .publish_subscribe::<u32>()
                .create()
                .unwrap();
            assert_eq!(node.list_services().unwrap().len(), 2);
            drop(node);

            let observer = test_node(&config);
            assert!(observer.list_services().unwrap().is_empty());
        }
    }

    #[test]
    fn test_invalid_service_names() {
        for bad in ["", "/leading", "trailing/", "double//slash", "spa ce", "ümlaut"] {
            assert!(matches!(
                ServiceName::new(bad),
                Err(EaselError::InvalidServiceName { .. })
            ));
        }
        assert!(ServiceName::new(&"x".repeat(129)).is_err());
        assert!(ServiceName::new("radar/front-left_v2.0").is_ok());
    }

    #[test]
    fn test_wait_cycle() {
        let dir = TempDir::new().unwrap();
        let node = test_node(&test_config(&dir));

        let start = Instant::now();
        for _ in 0..3 {
            node.wait(Duration::from_millis(10)).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(30));

        node.request_shutdown();
        assert!(node.is_shutdown_requested());
        assert!(matches!(
            node.wait(Duration::from_secs(5)),
            Err(EaselError::Terminated)
        ));
    }

    #[test]
    fn test_shutdown_is_per_node() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let stopping = test_node(&config);
        let running = test_node(&config);

        stopping.request_shutdown();
        assert!(stopping.wait(Duration::ZERO).is_err());
        assert!(running.wait(Duration::ZERO).is_ok());
    }
}
