//! Repository reads, writes and caching against a live PostgreSQL
//!
//! Tests sharing a table run serially.

mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::{drop_table, test_store, test_store_with};
use entity_store::{impl_entity, with_timeout, RepositorySettings, StoreError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
struct Player {
    id: i64,
    name: String,
    guild: String,
    level: i32,
    online: bool,
    joined_at: Option<DateTime<Utc>>,
    badges: Vec<String>,
}

impl_entity!(Player, table = "rt_players", key = id, fields {
    id: i64 => "id",
    name: String => "name",
    guild: String => "guild",
    level: i32 => "level",
    online: bool => "online",
    joined_at: Option<DateTime<Utc>> => "joined_at",
    badges: Vec<String> => "badges",
});

fn player(name: &str, guild: &str, level: i32) -> Player {
    Player {
        name: name.into(),
        guild: guild.into(),
        level,
        ..Player::default()
    }
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_save_assigns_key_and_find_skips_default_fields() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-find");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;

    let mut ann = player("ann", "red", 3);
    ann.joined_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    ann.badges = vec!["founder".into()];
    players.save(&mut ann, true).await?;
    assert!(ann.id > 0);

    let mut bob = player("bob", "red", 0);
    players.save(&mut bob, true).await?;
    let mut cat = player("cat", "blue", 3);
    players.save(&mut cat, false).await?;
    assert_eq!(cat.id, 0);

    // level 0 and online false are defaults, so only guild filters
    let red = players.find_many(&player("", "red", 0), None).await?;
    assert_eq!(red.len(), 2);
    assert_eq!(red[0], ann);
    assert_eq!(red[1].name, "bob");

    let level3 = players.find_all(&player("", "", 3), 10).await?;
    assert_eq!(level3.len(), 2);

    let first = players.find(&player("", "", 3)).await?.expect("ann matches");
    assert_eq!(first.name, "ann");

    let limited = players.find_all(&Player::default(), 2).await?;
    assert_eq!(limited.len(), 2);

    assert!(players.find(&player("nobody", "", 0)).await?.is_none());
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_find_by_column_handles_default_values() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-by-column");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;

    for p in [player("ann", "red", 0), player("bob", "red", 5), player("cat", "blue", 0)] {
        let mut p = p;
        players.save(&mut p, false).await?;
    }

    // level = 0 cannot be expressed by example, but can by column
    let zero = players.find_all_by_column("level", [0]).await?;
    assert_eq!(zero.len(), 2);

    let by_name = players.find_by_column("NAME", "bob").await?.expect("bob exists");
    assert_eq!(by_name.level, 5);

    let many = players.find_all_by_column("name", ["ann", "cat", "zed"]).await?;
    let names: Vec<_> = many.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["ann", "cat"]);

    let err = players.find_by_column("missing", "x").await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    assert!(players.find_all_by_column("name", Vec::<String>::new()).await?.is_empty());
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_cached_reads_skip_the_database() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-cache");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;

    let mut ann = player("ann", "red", 1);
    players.save(&mut ann, true).await?;

    let template = player("", "red", 0);
    let before = players.stats().queries;
    let first = players.find_many(&template, None).await?;
    let second = players.find_many(&template, None).await?;
    assert_eq!(first, second);
    assert_eq!(players.stats().queries, before + 1);
    assert_eq!(players.stats().cache_hits, 1);

    // An update touching the cached row invalidates the result
    ann.level = 2;
    assert_eq!(players.update(&ann).await?, 1);
    let third = players.find_many(&template, None).await?;
    assert_eq!(third[0].level, 2);
    assert_eq!(players.stats().queries, before + 3);

    // A new row in the same guild invalidates the list
    let mut bob = player("bob", "red", 1);
    players.save(&mut bob, true).await?;
    assert_eq!(players.find_many(&template, None).await?.len(), 2);

    // Disabled cache reads through every time
    players.set_cache_enabled(false);
    let reads = players.stats().queries;
    players.find_many(&template, None).await?;
    players.find_many(&template, None).await?;
    assert_eq!(players.stats().queries, reads + 2);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_key_column_lookup_sees_later_save() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-key-column");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;

    // Empty results are cached too
    assert!(players.find_by_column("id", 7i64).await?.is_none());
    assert!(players.find_all_by_column("id", [7i64, 8]).await?.is_empty());

    let mut seven = player("seven", "red", 1);
    seven.id = 7;
    players.save(&mut seven, true).await?;

    let found = players.find_by_column("id", 7i64).await?.expect("saved row is visible");
    assert_eq!(found.name, "seven");
    assert_eq!(players.find_all_by_column("id", [7i64, 8]).await?.len(), 1);

    // Deleting the row drops the cached hit
    players.delete(&player("seven", "", 0)).await?;
    assert!(players.find_by_column("id", 7i64).await?.is_none());
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_cache_entries_expire_after_idle_duration() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-expiry");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;
    players.set_cache_duration(Duration::from_millis(200));

    let mut ann = player("ann", "red", 1);
    players.save(&mut ann, true).await?;

    let before = players.stats().queries;
    players.find_by_key(ann.id).await?;
    tokio::time::sleep(Duration::from_millis(350)).await;
    players.find_by_key(ann.id).await?;
    assert_eq!(players.stats().queries, before + 2);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_external_changes_need_explicit_invalidation() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-external");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;

    let mut ann = player("ann", "red", 1);
    players.save(&mut ann, true).await?;
    players.find_by_key(ann.id).await?;

    common::execute(&format!("UPDATE rt_players SET level = 9 WHERE id = {}", ann.id)).await?;
    assert_eq!(players.find_by_key(ann.id).await?.unwrap().level, 1);

    players.invalidate_entity(&ann)?;
    assert_eq!(players.find_by_key(ann.id).await?.unwrap().level, 9);

    common::execute(&format!("UPDATE rt_players SET level = 10 WHERE id = {}", ann.id)).await?;
    players.clear_cache();
    assert_eq!(players.find_by_key(ann.id).await?.unwrap().level, 10);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_upsert_overwrites_existing_key() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-upsert");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;

    let mut ann = player("ann", "red", 1);
    players.save(&mut ann, true).await?;

    let mut renamed = player("anne", "blue", 4);
    renamed.id = ann.id;
    players.save(&mut renamed, true).await?;

    assert_eq!(players.count(&Player::default()).await?, 1);
    let stored = players.find_by_key(ann.id).await?.unwrap();
    assert_eq!(stored.name, "anne");
    assert_eq!(stored.guild, "blue");

    // Update of a missing key touches nothing
    let mut ghost = player("ghost", "", 1);
    ghost.id = ann.id + 1000;
    assert_eq!(players.update(&ghost).await?, 0);

    let err = players.update(&player("keyless", "", 1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_delete_requires_a_filter() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-delete");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;

    for p in [player("ann", "red", 1), player("bob", "red", 2), player("cat", "blue", 3)] {
        let mut p = p;
        players.save(&mut p, false).await?;
    }
    let cached = players.find_many(&player("", "red", 0), None).await?;
    assert_eq!(cached.len(), 2);

    let err = players.delete(&Player::default()).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(players.count(&Player::default()).await?, 3);

    assert_eq!(players.delete(&player("bob", "", 0)).await?, 1);
    assert_eq!(players.find_many(&player("", "red", 0), None).await?.len(), 1);

    assert_eq!(players.delete_all().await?, 2);
    assert!(players.find_many(&Player::default(), None).await?.is_empty());
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Setting {
    name: String,
    value: String,
}

impl_entity!(Setting, table = "rt_settings", key = name, fields {
    name: String => "name",
    value: String => "value",
});

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_natural_keys_must_be_supplied() -> anyhow::Result<()> {
    drop_table("rt_settings").await?;
    let store = test_store("rt-natural");
    store.ensure_schema::<Setting>().await?;
    let settings = store.repository::<Setting>().await?;

    let mut missing = Setting {
        name: String::new(),
        value: "x".into(),
    };
    let err = settings.save(&mut missing, true).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    let mut theme = Setting {
        name: "theme".into(),
        value: "dark".into(),
    };
    settings.save(&mut theme, true).await?;
    assert_eq!(settings.find_by_key("theme").await?.unwrap().value, "dark");
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Device {
    id: Uuid,
    serial: String,
}

impl_entity!(Device, table = "rt_devices", key = id, fields {
    id: Uuid => "id",
    serial: String => "serial",
});

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_uuid_keys_are_generated() -> anyhow::Result<()> {
    drop_table("rt_devices").await?;
    let store = test_store_with(
        "rt-uuid",
        RepositorySettings {
            cache_enabled: false,
            ..RepositorySettings::default()
        },
    );
    store.ensure_schema::<Device>().await?;
    let devices = store.repository::<Device>().await?;
    assert!(!devices.cache_enabled());

    let mut device = Device {
        id: Uuid::nil(),
        serial: "sn-1".into(),
    };
    devices.save(&mut device, true).await?;
    assert!(!device.id.is_nil());
    assert_eq!(devices.find_by_key(device.id).await?.unwrap().serial, "sn-1");
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_store_shares_one_repository_per_type() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-shared");
    store.ensure_schema::<Player>().await?;

    let (a, b) = tokio::join!(store.repository::<Player>(), store.repository::<Player>());
    assert!(std::sync::Arc::ptr_eq(&a?, &b?));
    assert_eq!(store.repository_count(), 1);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_per_call_timeout_overrides_default() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-timeout");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;

    let err = with_timeout(Duration::from_nanos(1), players.count(&Player::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Timeout { .. }));

    // A concurrent call without a scope keeps the repository default
    let template = Player::default();
    let (tight, default) = tokio::join!(
        with_timeout(Duration::from_nanos(1), players.count(&template)),
        players.count(&template),
    );
    assert!(tight.is_err());
    assert_eq!(default?, 0);

    // A generous deadline beats a default that is too tight
    players.set_query_timeout(Duration::from_nanos(1));
    let count = with_timeout(Duration::from_secs(5), players.count(&Player::default())).await?;
    assert_eq!(count, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
#[serial_test::serial]
async fn test_store_close_shuts_down_unshared_pools() -> anyhow::Result<()> {
    drop_table("rt_players").await?;
    let store = test_store("rt-close");
    store.ensure_schema::<Player>().await?;
    let players = store.repository::<Player>().await?;
    let mut ann = player("ann", "red", 1);
    players.save(&mut ann, true).await?;
    assert!(common::backend_count("rt-close-rt_players").await? > 0);

    drop(players);
    assert_eq!(store.close().await, 1);

    let mut remaining = common::backend_count("rt-close-rt_players").await?;
    for _ in 0..20 {
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        remaining = common::backend_count("rt-close-rt_players").await?;
    }
    assert_eq!(remaining, 0);

    // A handle still held by a caller keeps its pool open
    let store = test_store("rt-close-held");
    let held = store.repository::<Player>().await?;
    assert_eq!(store.close().await, 0);
    assert_eq!(held.find_by_key(ann.id).await?.map(|p| p.name), Some("ann".to_string()));
    Ok(())
}
