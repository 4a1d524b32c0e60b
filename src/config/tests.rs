use super::*;

#[test]
fn defaults_match_the_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.cache, CacheSettings::default());
    assert_eq!(settings.cache.default_duration, Duration::from_secs(3600));
    assert_eq!(settings.store.backend, StoreBackend::Memory);
    assert_eq!(settings.store.memory_max_entries, 20);
    assert_eq!(settings.store.directory, PathBuf::from("cache"));
    assert_eq!(settings.store.database_url, "sqlite://recall.db");
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("sqlite".to_string());
    raw.logging.level = Some("info".to_string());

    let overrides = Overrides {
        store_backend: Some("file".to_string()),
        store_directory: Some(PathBuf::from("/tmp/recall")),
        log_level: Some("debug".to_string()),
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.store.backend, StoreBackend::File);
    assert!(settings.store.embeds_type_header());
    assert_eq!(settings.store.directory, PathBuf::from("/tmp/recall"));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn cache_section_is_parsed() {
    let mut raw = RawSettings::default();
    raw.cache.default_duration_seconds = Some(120);
    raw.cache.compress_by_default = Some(true);
    raw.cache.require_metadata = Some(true);
    raw.cache.default_operation = Some("everything".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.default_duration, Duration::from_secs(120));
    assert!(settings.cache.compress_by_default);
    assert!(!settings.cache.encrypt_by_default);
    assert!(settings.cache.require_metadata);
    assert_eq!(settings.cache.predicate, OperationPredicate::CacheEverything);
}

#[test]
fn invalid_values_name_their_key() {
    let cases: Vec<(&str, Box<dyn Fn(&mut RawSettings)>)> = vec![
        (
            "cache.default_duration_seconds",
            Box::new(|raw: &mut RawSettings| raw.cache.default_duration_seconds = Some(0)),
        ),
        (
            "cache.compression_level",
            Box::new(|raw: &mut RawSettings| raw.cache.compression_level = Some(12)),
        ),
        (
            "cache.default_operation",
            Box::new(|raw: &mut RawSettings| {
                raw.cache.default_operation = Some("sometimes".into())
            }),
        ),
        (
            "store.backend",
            Box::new(|raw: &mut RawSettings| raw.store.backend = Some("redis".into())),
        ),
        (
            "logging.level",
            Box::new(|raw: &mut RawSettings| raw.logging.level = Some("loud".into())),
        ),
    ];

    for (expected_key, mutate) in cases {
        let mut raw = RawSettings::default();
        mutate(&mut raw);
        match Settings::from_raw(raw) {
            Err(LoadError::Invalid { key, .. }) => assert_eq!(key, expected_key),
            other => panic!("expected invalid `{expected_key}`, got {other:?}"),
        }
    }
}

#[test]
fn blank_database_url_falls_back_to_default() {
    let mut raw = RawSettings::default();
    raw.store.database_url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.store.database_url, DEFAULT_DATABASE_URL);
}

#[test]
fn subcommands_parse_with_global_overrides() {
    let args = CliArgs::parse_from([
        "recall",
        "clear",
        "--type",
        "app::User",
        "--stale-only",
        "--store-backend",
        "sqlite",
    ]);
    assert_eq!(args.overrides.store_backend.as_deref(), Some("sqlite"));
    let Some(Command::Clear(clear)) = args.command else {
        panic!("expected clear command");
    };
    assert_eq!(clear.type_name.as_deref(), Some("app::User"));
    assert!(clear.stale_only);

    let args = CliArgs::parse_from([
        "recall",
        "invalidate",
        "--url",
        "https://api.example.com/users/1",
        "--type",
        "app::User",
    ]);
    let Some(Command::Invalidate(invalidate)) = args.command else {
        panic!("expected invalidate command");
    };
    assert_eq!(invalidate.method, "GET");
    assert_eq!(invalidate.body, None);
}

#[test]
fn missing_command_defaults_to_stats() {
    let args = CliArgs::parse_from(["recall"]);
    let command = args.command.unwrap_or(Command::Stats);
    assert!(matches!(command, Command::Stats));
}
