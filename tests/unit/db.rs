use chrono::{TimeZone, Utc};
use crm_messaging::db::{datetime_to_i64, db_kind_from_url, i64_to_datetime, rewrite_sql, DbKind};

#[test]
fn test_db_kind_from_url() {
    assert_eq!(db_kind_from_url("sqlite:///tmp/crm.sqlite?mode=rwc"), DbKind::Sqlite);
    assert_eq!(db_kind_from_url("postgres://localhost/crm"), DbKind::Postgres);
    assert_eq!(db_kind_from_url("POSTGRESQL://localhost/crm"), DbKind::Postgres);
}

#[test]
fn test_db_kind_unknown_scheme_falls_back_to_sqlite() {
    assert_eq!(db_kind_from_url("mysql://localhost/crm"), DbKind::Sqlite);
}

#[test]
fn test_rewrite_sql_sqlite_untouched() {
    let sql = "UPDATE message_records SET current_status = ? WHERE id = ?";
    assert_eq!(rewrite_sql(sql, DbKind::Sqlite).as_ref(), sql);
}

#[test]
fn test_rewrite_sql_postgres_numbers_placeholders() {
    let sql = "UPDATE message_records SET current_status = ? WHERE id = ? AND current_status = ?";
    assert_eq!(
        rewrite_sql(sql, DbKind::Postgres).as_ref(),
        "UPDATE message_records SET current_status = $1 WHERE id = $2 AND current_status = $3"
    );
}

#[test]
fn test_rewrite_sql_without_placeholders() {
    let sql = "SELECT COUNT(*) FROM contacts";
    assert_eq!(rewrite_sql(sql, DbKind::Postgres).as_ref(), sql);
}

#[test]
fn test_epoch_seconds_conversion() {
    let dt = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 0).unwrap();
    let ts = datetime_to_i64(dt);
    assert_eq!(ts, 1_709_209_800);
    assert_eq!(i64_to_datetime(ts), dt);
}
