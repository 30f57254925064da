//! SQL query constants and builders
//!
//! Contains all catalog queries used by the snapshot, drift and restore code.
//! Backend-private temporary namespaces (`pg_temp_N`, `pg_toast_temp_N`) are
//! filtered out everywhere.

/// Schema the restore engine uses for its scratch tables
pub const WORK_SCHEMA: &str = "_pgfixture";

/// Prefix of every temporary name the restore engine hands out
pub const TEMP_NAME_PREFIX: &str = "_pgfixture_";

/// Schemas, tables and extensions in a single statement, so all three come
/// from the same MVCC snapshot.
pub const CAPTURE_SNAPSHOT: &str = r#"
    SELECT 'schema' AS kind, n.nspname::text AS name, NULL::text AS schema_name, NULL::oid AS object_id
    FROM pg_catalog.pg_namespace n
    WHERE n.nspname <> '_pgfixture'
        AND n.nspname !~ '^pg_(toast_)?temp_'
    UNION ALL
    SELECT 'table', c.relname::text, n.nspname::text, c.oid
    FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r', 'p')
        AND n.nspname <> '_pgfixture'
        AND n.nspname !~ '^pg_(toast_)?temp_'
    UNION ALL
    SELECT 'extension', e.extname::text, NULL, NULL
    FROM pg_catalog.pg_extension e
    ORDER BY kind, schema_name, name
"#;

/// True unless schemas, tables and extensions all match the baseline.
/// A baseline table matches when its oid still sits at the captured location.
///
/// $1 = baseline schemas, $2 = baseline table oids, $3 = baseline extensions,
/// $4 = baseline table schemas, $5 = baseline table names (parallel to $2)
pub const IS_DIRTY: &str = r#"
    SELECT
        EXISTS(
            SELECT 1 FROM pg_catalog.pg_namespace n
            WHERE n.nspname::text <> ALL($1::text[])
                AND n.nspname <> '_pgfixture'
                AND n.nspname !~ '^pg_(toast_)?temp_'
            LIMIT 1
        )
        OR
        EXISTS(
            SELECT 1 FROM unnest($1::text[]) AS base(schema_name)
            WHERE NOT EXISTS (
                SELECT 1 FROM pg_catalog.pg_namespace n
                WHERE n.nspname::text = base.schema_name
            )
            LIMIT 1
        )
        OR
        EXISTS(
            SELECT 1 FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p')
                AND n.nspname <> '_pgfixture'
                AND n.nspname !~ '^pg_(toast_)?temp_'
                AND c.oid <> ALL($2::oid[])
            LIMIT 1
        )
        OR
        EXISTS(
            SELECT 1 FROM unnest($4::text[], $5::text[], $2::oid[]) AS base(schema_name, table_name, object_id)
                LEFT JOIN pg_catalog.pg_class c
                    ON c.oid = base.object_id AND c.relkind IN ('r', 'p')
                LEFT JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE c.oid IS NULL
                OR c.relname::text <> base.table_name
                OR n.nspname::text <> base.schema_name
            LIMIT 1
        )
        OR
        EXISTS(
            SELECT 1 FROM pg_catalog.pg_extension e
            WHERE e.extname::text <> ALL($3::text[])
            LIMIT 1
        )
        OR
        EXISTS(
            SELECT 1 FROM unnest($3::text[]) AS base(extname)
            WHERE NOT EXISTS (
                SELECT 1 FROM pg_catalog.pg_extension e
                WHERE e.extname::text = base.extname
            )
            LIMIT 1
        ) AS dirty
"#;

/// $1 = baseline extensions
pub const EXTRA_EXTENSIONS: &str = r#"
    SELECT e.extname::text AS extname
    FROM pg_catalog.pg_extension e
    WHERE e.extname::text <> ALL($1::text[])
    ORDER BY e.extname
"#;

/// Recreate the working schema and materialize the current table state into it
pub const PREPARE_WORK_SCHEMA: &str = r#"
    DROP SCHEMA IF EXISTS _pgfixture CASCADE;
    CREATE SCHEMA _pgfixture;

    CREATE UNLOGGED TABLE _pgfixture.current_tables AS
        SELECT n.nspname::text AS schema_name, c.relname::text AS table_name, c.oid AS object_id
        FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        WHERE c.relkind IN ('r', 'p')
            AND n.nspname !~ '^pg_(toast_)?temp_';

    CREATE UNLOGGED TABLE _pgfixture.original_tables (
        LIKE _pgfixture.current_tables EXCLUDING ALL
    );
"#;

/// $1 = schema names, $2 = table names, $3 = oids
pub const LOAD_ORIGINAL_TABLES: &str = r#"
    INSERT INTO _pgfixture.original_tables (schema_name, table_name, object_id)
    SELECT * FROM unnest($1::text[], $2::text[], $3::oid[])
"#;

/// Baseline tables that were renamed, moved or dropped. `cur_*` is NULL for dropped ones.
pub const MOVED_TABLES: &str = r#"
    SELECT
        orig.object_id,
        orig.schema_name AS orig_schema,
        orig.table_name AS orig_table,
        cur.schema_name AS cur_schema,
        cur.table_name AS cur_table
    FROM _pgfixture.original_tables AS orig
    LEFT JOIN _pgfixture.current_tables AS cur
        ON orig.object_id = cur.object_id
    WHERE cur.object_id IS NULL
        OR orig.table_name <> cur.table_name
        OR orig.schema_name <> cur.schema_name
    ORDER BY orig.schema_name, orig.table_name
"#;

/// Non-baseline relations of any kind (tables, views, sequences, indexes...)
/// sitting on a destination name. They all share the schema's namespace.
/// $1 = destination schemas, $2 = destination names, $3 = baseline oids
pub const SQUATTING_RELATIONS: &str = r#"
    SELECT
        c.oid AS object_id,
        c.relkind::text AS relkind,
        n.nspname::text AS schema_name,
        c.relname::text AS table_name
    FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        JOIN unnest($1::text[], $2::text[]) AS dest(schema_name, table_name)
            ON dest.schema_name = n.nspname::text AND dest.table_name = c.relname::text
    WHERE c.oid <> ALL($3::oid[])
"#;

/// $1 = baseline schemas
pub const EXTRA_SCHEMAS: &str = r#"
    SELECT n.nspname::text AS nspname
    FROM pg_catalog.pg_namespace n
    WHERE n.nspname::text <> ALL($1::text[])
        AND n.nspname <> '_pgfixture'
        AND n.nspname !~ '^pg_(toast_)?temp_'
    ORDER BY n.nspname
"#;

/// $1 = schema name
pub const SCHEMA_TABLES: &str = r#"
    SELECT c.relname::text AS table_name
    FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r', 'p')
        AND n.nspname::text = $1
    ORDER BY c.relname
"#;

/// $1 = baseline oids
pub const EXTRA_TABLES: &str = r#"
    SELECT n.nspname::text AS schema_name, c.relname::text AS table_name
    FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r', 'p')
        AND c.oid <> ALL($1::oid[])
        AND n.nspname <> '_pgfixture'
        AND n.nspname !~ '^pg_(toast_)?temp_'
    ORDER BY n.nspname, c.relname
"#;

pub const CLEANUP_WORK_SCHEMA: &str = "DROP SCHEMA IF EXISTS _pgfixture CASCADE; COMMIT;";

pub const HAS_SCHEMA: &str =
    "SELECT EXISTS(SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname::text = $1 LIMIT 1)";

pub const HAS_EXTENSION: &str =
    "SELECT EXISTS(SELECT 1 FROM pg_catalog.pg_extension WHERE extname::text = $1 LIMIT 1)";

pub const EXTENSION_AVAILABLE: &str =
    "SELECT EXISTS(SELECT 1 FROM pg_catalog.pg_available_extensions WHERE name::text = $1 LIMIT 1)";

/// Bare table name, searched in every schema
pub const HAS_TABLE_ANY_SCHEMA: &str =
    "SELECT EXISTS(SELECT 1 FROM pg_catalog.pg_tables WHERE tablename::text = $1 LIMIT 1)";

pub const HAS_TABLE_IN_SCHEMA: &str = r#"
    SELECT EXISTS(
        SELECT 1 FROM pg_catalog.pg_tables
        WHERE tablename::text = $1 AND schemaname::text = $2
        LIMIT 1
    )
"#;

/// SQL builder for safe identifier quoting
pub struct SqlBuilder;

impl SqlBuilder {
    /// Quote an identifier (schema/table/extension name) safely
    pub fn quote_ident(ident: &str) -> String {
        // PostgreSQL identifier quoting
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// `"schema"."table"`
    pub fn qualified(schema: &str, table: &str) -> String {
        format!("{}.{}", Self::quote_ident(schema), Self::quote_ident(table))
    }

    pub fn drop_extension(name: &str) -> String {
        format!("DROP EXTENSION IF EXISTS {} CASCADE", Self::quote_ident(name))
    }

    pub fn drop_schema(name: &str) -> String {
        format!("DROP SCHEMA {} CASCADE", Self::quote_ident(name))
    }

    pub fn drop_table(schema: &str, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {} CASCADE", Self::qualified(schema, table))
    }

    pub fn rename_table(schema: &str, table: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            Self::qualified(schema, table),
            Self::quote_ident(new_name)
        )
    }

    /// Rename any `pg_class` entry, picking the `ALTER` form that matches its relkind
    pub fn rename_relation(relkind: &str, schema: &str, name: &str, new_name: &str) -> String {
        let kind = match relkind {
            "v" => "VIEW",
            "m" => "MATERIALIZED VIEW",
            "S" => "SEQUENCE",
            "i" | "I" => "INDEX",
            "f" => "FOREIGN TABLE",
            "c" => "TYPE",
            _ => "TABLE",
        };
        format!(
            "ALTER {} {} RENAME TO {}",
            kind,
            Self::qualified(schema, name),
            Self::quote_ident(new_name)
        )
    }

    pub fn set_schema(schema: &str, table: &str, new_schema: &str) -> String {
        format!(
            "ALTER TABLE {} SET SCHEMA {}",
            Self::qualified(schema, table),
            Self::quote_ident(new_schema)
        )
    }

    pub fn create_schema(name: &str, if_not_exists: bool) -> String {
        let check = if if_not_exists { "IF NOT EXISTS " } else { "" };
        format!("CREATE SCHEMA {}{}", check, Self::quote_ident(name))
    }

    pub fn create_extension(name: &str, if_not_exists: bool, schema: Option<&str>) -> String {
        let check = if if_not_exists { "IF NOT EXISTS " } else { "" };
        match schema {
            Some(schema) => format!(
                "CREATE EXTENSION {}{} WITH SCHEMA {}",
                check,
                Self::quote_ident(name),
                Self::quote_ident(schema)
            ),
            None => format!("CREATE EXTENSION {}{}", check, Self::quote_ident(name)),
        }
    }

    /// Join statements into one batch, `None` when there is nothing to run
    pub fn batch<I>(statements: I) -> Option<String>
    where
        I: IntoIterator<Item = String>,
    {
        let joined = statements.into_iter().collect::<Vec<_>>().join(";\n");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_embedded_quotes() {
        assert_eq!(SqlBuilder::quote_ident("users"), "\"users\"");
        assert_eq!(
            SqlBuilder::quote_ident("foo\"; DROP TABLE test CASCADE; --"),
            "\"foo\"\"; DROP TABLE test CASCADE; --\""
        );
    }

    #[test]
    fn test_builders_quote_every_identifier() {
        assert_eq!(
            SqlBuilder::rename_table("My Schema", "t", "_pgfixture_1_ab"),
            "ALTER TABLE \"My Schema\".\"t\" RENAME TO \"_pgfixture_1_ab\""
        );
        assert_eq!(
            SqlBuilder::set_schema("a", "b", "c"),
            "ALTER TABLE \"a\".\"b\" SET SCHEMA \"c\""
        );
        assert_eq!(
            SqlBuilder::drop_extension("uuid-ossp"),
            "DROP EXTENSION IF EXISTS \"uuid-ossp\" CASCADE"
        );
        assert_eq!(
            SqlBuilder::create_extension("pgcrypto", true, Some("ext")),
            "CREATE EXTENSION IF NOT EXISTS \"pgcrypto\" WITH SCHEMA \"ext\""
        );
        assert_eq!(SqlBuilder::create_schema("s", false), "CREATE SCHEMA \"s\"");
    }

    #[test]
    fn test_rename_relation_matches_relkind() {
        assert_eq!(
            SqlBuilder::rename_relation("v", "s", "alpha", "x"),
            "ALTER VIEW \"s\".\"alpha\" RENAME TO \"x\""
        );
        assert_eq!(
            SqlBuilder::rename_relation("m", "s", "alpha", "x"),
            "ALTER MATERIALIZED VIEW \"s\".\"alpha\" RENAME TO \"x\""
        );
        assert_eq!(
            SqlBuilder::rename_relation("S", "s", "alpha", "x"),
            "ALTER SEQUENCE \"s\".\"alpha\" RENAME TO \"x\""
        );
        assert_eq!(
            SqlBuilder::rename_relation("i", "s", "alpha", "x"),
            "ALTER INDEX \"s\".\"alpha\" RENAME TO \"x\""
        );
        assert_eq!(
            SqlBuilder::rename_relation("p", "s", "alpha", "x"),
            SqlBuilder::rename_table("s", "alpha", "x")
        );
    }

    #[test]
    fn test_batch_skips_empty_input() {
        assert_eq!(SqlBuilder::batch(Vec::new()), None);
        assert_eq!(
            SqlBuilder::batch(vec!["SELECT 1".to_string(), "SELECT 2".to_string()]),
            Some("SELECT 1;\nSELECT 2".to_string())
        );
    }

    #[test]
    fn test_work_schema_queries_agree_on_name() {
        for query in [
            PREPARE_WORK_SCHEMA,
            CAPTURE_SNAPSHOT,
            IS_DIRTY,
            EXTRA_SCHEMAS,
            EXTRA_TABLES,
            CLEANUP_WORK_SCHEMA,
        ] {
            assert!(query.contains(WORK_SCHEMA));
        }
        assert!(TEMP_NAME_PREFIX.starts_with(WORK_SCHEMA));
    }
}
