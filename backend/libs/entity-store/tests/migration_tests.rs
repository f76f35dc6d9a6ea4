//! Schema reconciliation against a live PostgreSQL
//!
//! Several declarations below map to the same table to model a struct that
//! changed between releases.

mod common;

use common::{drop_table, live_columns, tables_like, test_store};
use entity_store::{impl_entity, MigrationKind, MigrationPlan};

mod idempotent {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Account {
        pub id: i64,
        pub email: String,
        pub balance: f64,
        pub tags: Vec<String>,
        pub profile: serde_json::Value,
    }

    entity_store::impl_entity!(Account, table = "mt_accounts", key = id, fields {
        id: i64 => "id",
        email: String => "email",
        balance: f64 => "balance",
        tags: Vec<String> => "tags",
        profile: serde_json::Value => "profile",
    });
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_second_run_is_a_no_op() -> anyhow::Result<()> {
    drop_table("mt_accounts").await?;
    let store = test_store("mt-idempotent");

    let first = store.ensure_schema::<idempotent::Account>().await?;
    assert_eq!(first.kind, MigrationKind::Created);
    assert_eq!(first.statements.len(), 1);

    let second = store.ensure_schema::<idempotent::Account>().await?;
    assert_eq!(second.kind, MigrationKind::Unchanged);
    assert!(second.statements.is_empty());

    assert_eq!(store.plan_schema::<idempotent::Account>().await?, MigrationPlan::UpToDate);
    Ok(())
}

mod widen {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ScoreV1 {
        pub id: i64,
        pub score: i16,
    }

    entity_store::impl_entity!(ScoreV1, table = "mt_scores", key = id, fields {
        id: i64 => "id",
        score: i16 => "score",
    });

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ScoreV2 {
        pub id: i64,
        pub score: i64,
        pub note: String,
    }

    entity_store::impl_entity!(ScoreV2, table = "mt_scores", key = id, fields {
        id: i64 => "id",
        score: i64 => "score",
        note: String => "note",
    });
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_widening_and_new_columns_alter_in_place() -> anyhow::Result<()> {
    drop_table("mt_scores").await?;
    let store = test_store("mt-widen");

    store.ensure_schema::<widen::ScoreV1>().await?;
    let v1 = store.repository::<widen::ScoreV1>().await?;
    let mut row = widen::ScoreV1 { id: 0, score: 12 };
    v1.save(&mut row, true).await?;
    assert!(row.id > 0);

    let plan = store.plan_schema::<widen::ScoreV2>().await?;
    assert!(matches!(plan, MigrationPlan::InPlace(ref changes) if changes.len() == 2));

    let report = store.ensure_schema::<widen::ScoreV2>().await?;
    assert_eq!(report.kind, MigrationKind::Altered);
    assert_eq!(report.statements.len(), 2);

    let columns = live_columns("mt_scores").await?;
    assert!(columns.contains(&("score".to_string(), "bigint".to_string())));
    assert!(columns.contains(&("note".to_string(), "text".to_string())));

    let v2 = store.repository::<widen::ScoreV2>().await?;
    let found = v2.find_by_key(row.id).await?.expect("row survives widening");
    assert_eq!(found.score, 12);
    assert_eq!(found.note, "");
    Ok(())
}

mod retype {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct LedgerV1 {
        pub id: i64,
        pub label: String,
        pub amount: String,
    }

    entity_store::impl_entity!(LedgerV1, table = "mt_ledger", key = id, fields {
        id: i64 => "id",
        label: String => "label",
        amount: String => "amount",
    });

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct LedgerV2 {
        pub id: i64,
        pub label: String,
        pub amount: i32,
    }

    entity_store::impl_entity!(LedgerV2, table = "mt_ledger", key = id, fields {
        id: i64 => "id",
        label: String => "label",
        amount: i32 => "amount",
    });
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_incompatible_type_rebuilds_and_keeps_rows() -> anyhow::Result<()> {
    drop_table("mt_ledger").await?;
    let store = test_store("mt-retype");

    store.ensure_schema::<retype::LedgerV1>().await?;
    let v1 = store.repository::<retype::LedgerV1>().await?;
    let mut keys = Vec::new();
    for (label, amount) in [("rent", "900"), ("food", "42"), ("fuel", "7")] {
        let mut row = retype::LedgerV1 {
            id: 0,
            label: label.into(),
            amount: amount.into(),
        };
        v1.save(&mut row, true).await?;
        keys.push(row.id);
    }

    let report = store.ensure_schema::<retype::LedgerV2>().await?;
    assert_eq!(report.kind, MigrationKind::Rebuilt);

    let columns = live_columns("mt_ledger").await?;
    assert!(columns.contains(&("amount".to_string(), "integer".to_string())));

    let v2 = store.repository::<retype::LedgerV2>().await?;
    assert_eq!(v2.count(&retype::LedgerV2::default()).await?, 3);
    let food = v2.find_by_key(keys[1]).await?.expect("row carried over");
    assert_eq!(food.label, "food");
    assert_eq!(food.amount, 42);

    // The key sequence continues after the carried rows
    let mut next = retype::LedgerV2 {
        id: 0,
        label: "tax".into(),
        amount: 5,
    };
    v2.save(&mut next, true).await?;
    assert!(next.id > *keys.iter().max().unwrap());
    Ok(())
}

mod lossy {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ReadingV1 {
        pub id: i64,
        pub sensor: String,
        pub value: String,
    }

    entity_store::impl_entity!(ReadingV1, table = "mt_readings", key = id, fields {
        id: i64 => "id",
        sensor: String => "sensor",
        value: String => "value",
    });

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ReadingV2 {
        pub id: i64,
        pub sensor: String,
        pub value: i32,
    }

    entity_store::impl_entity!(ReadingV2, table = "mt_readings", key = id, fields {
        id: i64 => "id",
        sensor: String => "sensor",
        value: i32 => "value",
    });
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_unconvertible_values_are_dropped_not_the_rows() -> anyhow::Result<()> {
    drop_table("mt_readings").await?;
    let store = test_store("mt-lossy");

    store.ensure_schema::<lossy::ReadingV1>().await?;
    let v1 = store.repository::<lossy::ReadingV1>().await?;
    for (sensor, value) in [("a", "17"), ("b", "not a number")] {
        let mut row = lossy::ReadingV1 {
            id: 0,
            sensor: sensor.into(),
            value: value.into(),
        };
        v1.save(&mut row, false).await?;
    }

    let report = store.ensure_schema::<lossy::ReadingV2>().await?;
    assert_eq!(report.kind, MigrationKind::Rebuilt);

    let v2 = store.repository::<lossy::ReadingV2>().await?;
    let rows = v2.find_many(&lossy::ReadingV2::default(), None).await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.value == 0));
    assert_eq!(rows[0].sensor, "a");
    Ok(())
}

mod forced {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ItemV1 {
        pub id: i64,
        pub a: String,
        pub b: i32,
    }

    entity_store::impl_entity!(ItemV1, table = "mt_items", key = id, fields {
        id: i64 => "id",
        a: String => "a",
        b: i32 => "b",
    });

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ItemV2 {
        pub id: i64,
        pub a: String,
        pub c: bool,
    }

    entity_store::impl_entity!(ItemV2, table = "mt_items", key = id, fields {
        id: i64 => "id",
        a: String => "a",
        c: bool => "c",
    });
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_forced_rebuild_drops_and_adds_columns() -> anyhow::Result<()> {
    drop_table("mt_items").await?;
    let store = test_store("mt-forced");

    store.ensure_schema::<forced::ItemV1>().await?;
    let v1 = store.repository::<forced::ItemV1>().await?;
    let mut item = forced::ItemV1 {
        id: 0,
        a: "kept".into(),
        b: 3,
    };
    v1.save(&mut item, true).await?;

    let report = store.migrator().rebuild::<forced::ItemV2>().await?;
    assert_eq!(report.kind, MigrationKind::Rebuilt);

    let names: Vec<String> = live_columns("mt_items")
        .await?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["id", "a", "c"]);

    let v2 = store.repository::<forced::ItemV2>().await?;
    let found = v2.find_by_key(item.id).await?.expect("row carried over");
    assert_eq!(found.a, "kept");
    assert!(!found.c);

    // No temporary tables are left behind
    assert!(tables_like("mt_items_rebuild_%").await?.is_empty());
    Ok(())
}

mod reserved {
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Order {
        pub id: i64,
        pub group: String,
        pub user: String,
        pub select: i32,
    }

    entity_store::impl_entity!(Order, table = "order", key = id, fields {
        id: i64 => "id",
        group: String => "group",
        user: String => "user",
        select: i32 => "select",
    });

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct OrderV2 {
        pub id: i64,
        pub group: String,
        pub user: String,
        pub select: String,
    }

    entity_store::impl_entity!(OrderV2, table = "order", key = id, fields {
        id: i64 => "id",
        group: String => "group",
        user: String => "user",
        select: String => "select",
    });
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_reserved_words_work_as_names() -> anyhow::Result<()> {
    drop_table("order").await?;
    let store = test_store("mt-reserved");

    let report = store.ensure_schema::<reserved::Order>().await?;
    assert_eq!(report.kind, MigrationKind::Created);

    let orders = store.repository::<reserved::Order>().await?;
    let mut first = reserved::Order {
        id: 0,
        group: "a".into(),
        user: "ann".into(),
        select: 2,
    };
    orders.save(&mut first, true).await?;
    let mut second = reserved::Order {
        group: "b".into(),
        ..first.clone()
    };
    second.id = 0;
    orders.save(&mut second, true).await?;

    let group_a = reserved::Order {
        group: "a".into(),
        ..Default::default()
    };
    let by_group = orders.find_many(&group_a, None).await?;
    assert_eq!(by_group, vec![first.clone()]);
    assert_eq!(orders.find_all_by_column("user", ["ann"]).await?.len(), 2);

    first.select = 3;
    assert_eq!(orders.update(&first).await?, 1);
    orders.bulk_update(&[first.clone()]).await?;
    let loaded = reserved::Order {
        user: "bulk".into(),
        ..Default::default()
    };
    orders.bulk_insert(&[loaded]).await?;
    assert_eq!(orders.count(&reserved::Order::default()).await?, 3);

    // Rebuild swaps tables and resets the key sequence under the quoted name
    let report = store.ensure_schema::<reserved::OrderV2>().await?;
    assert_eq!(report.kind, MigrationKind::Rebuilt);
    let v2 = store.repository::<reserved::OrderV2>().await?;
    let carried = v2.find_by_key(first.id).await?.expect("row carried over");
    assert_eq!(carried.select, "3");

    let mut next = reserved::OrderV2 {
        group: "c".into(),
        ..Default::default()
    };
    v2.save(&mut next, true).await?;
    assert!(next.id > second.id);
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Invalid {
    id: i64,
    name: String,
}

impl_entity!(Invalid, table = "mt invalid", key = id, fields {
    id: i64 => "id",
    name: String => "name",
});

#[tokio::test]
async fn test_invalid_table_name_fails_before_connecting() {
    let store = test_store("mt-invalid");
    let err = store.ensure_schema::<Invalid>().await.unwrap_err();
    assert!(matches!(err, entity_store::StoreError::Configuration { .. }));
}
