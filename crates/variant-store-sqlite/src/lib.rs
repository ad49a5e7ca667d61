#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::FromSql;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use variant_store_core::{Nullable, QueryDescriptor, VariantRecord, VariantSource};

pub const VARIANT_TABLE: &str = "vs";

/// VM instructions between deadline checks on a running statement.
const DEADLINE_CHECK_OPS: i32 = 1_000;

/// Columns of [`VARIANT_TABLE`] in the order rows are decoded.
pub const VARIANT_COLUMNS: [&str; 30] = [
    "variant_id",
    "chromosome",
    "start",
    "reference",
    "alternate",
    "dbsnp",
    "call_rate",
    "ac",
    "af",
    "n_called",
    "n_not_called",
    "n_hom_ref",
    "n_het",
    "n_hom_var",
    "gene_symbol",
    "gene_id",
    "consequence",
    "impact",
    "hgvs_c",
    "hgvs_p",
    "clinvar_id",
    "clinical_significance",
    "cadd_phred",
    "gnomad_af",
    "gnomad_afr_af",
    "gnomad_amr_af",
    "gnomad_eas_af",
    "gnomad_nfe_af",
    "gnomad_sas_af",
    "exac_af",
];

const COUNT_VARIANTS_SQL: &str = r"
SELECT COUNT(*)
FROM vs
WHERE chromosome = ?1 AND start <= ?2 AND start >= ?3
";

const FETCH_VARIANTS_SQL: &str = r"
SELECT
  variant_id, chromosome, start, reference, alternate,
  dbsnp, call_rate, ac, af,
  n_called, n_not_called, n_hom_ref, n_het, n_hom_var,
  gene_symbol, gene_id, consequence, impact, hgvs_c, hgvs_p,
  clinvar_id, clinical_significance, cadd_phred,
  gnomad_af, gnomad_afr_af, gnomad_amr_af, gnomad_eas_af, gnomad_nfe_af, gnomad_sas_af,
  exac_af
FROM vs
WHERE chromosome = ?1 AND start <= ?2 AND start >= ?3
LIMIT ?4 OFFSET ?5
";

const INSERT_VARIANT_SQL: &str = r"
INSERT INTO vs (
  variant_id, chromosome, start, reference, alternate,
  dbsnp, call_rate, ac, af,
  n_called, n_not_called, n_hom_ref, n_het, n_hom_var,
  gene_symbol, gene_id, consequence, impact, hgvs_c, hgvs_p,
  clinvar_id, clinical_significance, cadd_phred,
  gnomad_af, gnomad_afr_af, gnomad_amr_af, gnomad_eas_af, gnomad_nfe_af, gnomad_sas_af,
  exac_af
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
  ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
  ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30
)
";

const FIXTURE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS vs (
  variant_id TEXT NOT NULL PRIMARY KEY,
  chromosome TEXT NOT NULL,
  start INTEGER NOT NULL,
  reference TEXT NOT NULL,
  alternate TEXT NOT NULL,
  dbsnp TEXT,
  call_rate REAL,
  ac INTEGER,
  af REAL,
  n_called INTEGER,
  n_not_called INTEGER,
  n_hom_ref INTEGER,
  n_het INTEGER,
  n_hom_var INTEGER,
  gene_symbol TEXT,
  gene_id TEXT,
  consequence TEXT,
  impact TEXT,
  hgvs_c TEXT,
  hgvs_p TEXT,
  clinvar_id TEXT,
  clinical_significance TEXT,
  cadd_phred REAL,
  gnomad_af REAL,
  gnomad_afr_af REAL,
  gnomad_amr_af REAL,
  gnomad_eas_af REAL,
  gnomad_nfe_af REAL,
  gnomad_sas_af REAL,
  exac_af REAL
);

CREATE INDEX IF NOT EXISTS idx_vs_chromosome_start ON vs(chromosome, start);
";

/// [`VariantSource`] over the `vs` table of a SQLite database.
///
/// One connection is shared by every caller; access is serialized by a mutex.
pub struct SqliteVariantStore {
    conn: Mutex<Connection>,
}

impl SqliteVariantStore {
    /// Opens (creating if needed) a writable database. Used for fixtures.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens an existing database without write access.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).with_context(|| {
            format!("failed to open sqlite database read-only at {}", path.display())
        })?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA query_only = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Round trip used by bootstrap to confirm the database answers.
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(())).context("sqlite ping failed")
    }

    /// Checks that the variant table exists with every decoded column.
    pub fn verify_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        if !table_exists(&conn, VARIANT_TABLE)? {
            return Err(anyhow!("variant schema check failed: expected table {VARIANT_TABLE}"));
        }
        ensure_table_has_columns(&conn, VARIANT_TABLE, &VARIANT_COLUMNS)
    }

    /// Creates the variant table and its window index.
    ///
    /// Fixture support only; the service never writes.
    pub fn create_fixture_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(FIXTURE_SCHEMA).context("failed to create fixture variant schema")
    }

    /// Inserts `records` in one transaction. Fixture support only.
    pub fn seed_fixture_variants(&self, records: &[VariantRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("failed to begin fixture transaction")?;
        {
            let mut stmt =
                tx.prepare(INSERT_VARIANT_SQL).context("failed to prepare fixture insert")?;
            for record in records {
                stmt.execute(params![
                    record.variant_id,
                    record.chromosome,
                    record.start,
                    record.reference,
                    record.alternate,
                    record.dbsnp.as_option(),
                    record.call_rate.as_option(),
                    record.ac.as_option(),
                    record.af.as_option(),
                    record.n_called.as_option(),
                    record.n_not_called.as_option(),
                    record.n_hom_ref.as_option(),
                    record.n_het.as_option(),
                    record.n_hom_var.as_option(),
                    record.gene_symbol.as_option(),
                    record.gene_id.as_option(),
                    record.consequence.as_option(),
                    record.impact.as_option(),
                    record.hgvs_c.as_option(),
                    record.hgvs_p.as_option(),
                    record.clinvar_id.as_option(),
                    record.clinical_significance.as_option(),
                    record.cadd_phred.as_option(),
                    record.gnomad_af.as_option(),
                    record.gnomad_afr_af.as_option(),
                    record.gnomad_amr_af.as_option(),
                    record.gnomad_eas_af.as_option(),
                    record.gnomad_nfe_af.as_option(),
                    record.gnomad_sas_af.as_option(),
                    record.exac_af.as_option(),
                ])
                .with_context(|| format!("failed to insert fixture variant {}", record.variant_id))?;
            }
        }
        tx.commit().context("failed to commit fixture variants")?;
        Ok(records.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

impl VariantSource for SqliteVariantStore {
    fn count_matching(&self, query: &QueryDescriptor, deadline: Option<Instant>) -> Result<i64> {
        let conn = self.lock()?;
        let _deadline = DeadlineGuard::install(&conn, deadline);
        conn.query_row(
            COUNT_VARIANTS_SQL,
            params![query.chromosome(), query.position_end(), query.position_start()],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to count variants on chromosome {}", query.chromosome()))
    }

    fn fetch_matching(
        &self,
        query: &QueryDescriptor,
        deadline: Option<Instant>,
        sink: &mut dyn FnMut(VariantRecord) -> Result<()>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let _deadline = DeadlineGuard::install(&conn, deadline);
        let mut stmt = conn
            .prepare_cached(FETCH_VARIANTS_SQL)
            .context("failed to prepare variant fetch")?;
        let mut rows = stmt
            .query(params![
                query.chromosome(),
                query.position_end(),
                query.position_start(),
                query.limit(),
                query.skip()
            ])
            .with_context(|| {
                format!("failed to fetch variants on chromosome {}", query.chromosome())
            })?;

        while let Some(row) = rows.next().context("failed to read variant row")? {
            let record = parse_variant_row(row).context("failed to decode variant row")?;
            sink(record)?;
        }

        Ok(())
    }
}

fn parse_variant_row(row: &Row<'_>) -> rusqlite::Result<VariantRecord> {
    Ok(VariantRecord {
        variant_id: row.get(0)?,
        chromosome: row.get(1)?,
        start: row.get(2)?,
        reference: row.get(3)?,
        alternate: row.get(4)?,
        dbsnp: nullable(row, 5)?,
        call_rate: nullable(row, 6)?,
        ac: nullable(row, 7)?,
        af: nullable(row, 8)?,
        n_called: nullable(row, 9)?,
        n_not_called: nullable(row, 10)?,
        n_hom_ref: nullable(row, 11)?,
        n_het: nullable(row, 12)?,
        n_hom_var: nullable(row, 13)?,
        gene_symbol: nullable(row, 14)?,
        gene_id: nullable(row, 15)?,
        consequence: nullable(row, 16)?,
        impact: nullable(row, 17)?,
        hgvs_c: nullable(row, 18)?,
        hgvs_p: nullable(row, 19)?,
        clinvar_id: nullable(row, 20)?,
        clinical_significance: nullable(row, 21)?,
        cadd_phred: nullable(row, 22)?,
        gnomad_af: nullable(row, 23)?,
        gnomad_afr_af: nullable(row, 24)?,
        gnomad_amr_af: nullable(row, 25)?,
        gnomad_eas_af: nullable(row, 26)?,
        gnomad_nfe_af: nullable(row, 27)?,
        gnomad_sas_af: nullable(row, 28)?,
        exac_af: nullable(row, 29)?,
    })
}

fn nullable<T: FromSql>(row: &Row<'_>, index: usize) -> rusqlite::Result<Nullable<T>> {
    row.get::<_, Option<T>>(index).map(Nullable::from)
}

/// Interrupts statements on the held connection once the deadline passes.
///
/// Must be dropped before the connection guard it borrows from.
struct DeadlineGuard<'c> {
    conn: &'c Connection,
}

impl<'c> DeadlineGuard<'c> {
    fn install(conn: &'c Connection, deadline: Option<Instant>) -> Self {
        if let Some(deadline) = deadline {
            conn.progress_handler(DEADLINE_CHECK_OPS, Some(move || Instant::now() >= deadline));
        }
        Self { conn }
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(DEADLINE_CHECK_OPS, None::<fn() -> bool>);
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    let missing: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|required| !available.iter().any(|candidate| candidate == required))
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!(
            "variant schema check failed: missing column(s) {table_name}.{}",
            missing.join(", ")
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use variant_store_core::{QueryError, QueryParams, Stage, VariantReader};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteVariantStore {
        let store = must(SqliteVariantStore::open(Path::new(":memory:")));
        must(store.create_fixture_schema());
        store
    }

    fn fixture_variant(chromosome: &str, start: i64, ordinal: usize) -> VariantRecord {
        VariantRecord::new(format!("{chromosome}-{start}-{ordinal}"), chromosome, start, "C", "T")
    }

    fn query(pairs: &[(&str, &str)]) -> QueryDescriptor {
        let params: QueryParams = pairs.iter().map(|(name, value)| (*name, *value)).collect();
        match QueryDescriptor::from_params(&params) {
            Ok(query) => query,
            Err(err) => panic!("invalid fixture query: {err}"),
        }
    }

    // `vs` as a view over an endless walk of positions on chromosome 1; any
    // filtered scan of it only ends when interrupted.
    fn unbounded_store() -> SqliteVariantStore {
        let store = must(SqliteVariantStore::open(Path::new(":memory:")));
        let annotations: Vec<String> =
            VARIANT_COLUMNS[5..].iter().map(|column| format!("NULL AS {column}")).collect();
        let view = format!(
            "CREATE VIEW vs AS
             WITH RECURSIVE walk(position) AS (
               SELECT 1
               UNION ALL
               SELECT position + 1 FROM walk
             )
             SELECT 'walk-' || position AS variant_id, '1' AS chromosome, position AS start,
                    'A' AS reference, 'G' AS alternate, {}
             FROM walk;",
            annotations.join(", ")
        );
        {
            let conn = must(store.lock());
            if let Err(err) = conn.execute_batch(&view) {
                panic!("failed to create unbounded view: {err}");
            }
        }
        store
    }

    fn seed_window(store: &SqliteVariantStore, chromosome: &str, count: usize) {
        let records: Vec<VariantRecord> = (0..count)
            .map(|ordinal| {
                let offset = i64::try_from(ordinal % 101).unwrap_or(0);
                fixture_variant(chromosome, 100 + offset, ordinal)
            })
            .collect();
        let inserted = must(store.seed_fixture_variants(&records));
        assert_eq!(inserted, count);
    }

    #[test]
    fn count_and_fetch_apply_inclusive_start_window() {
        let store = fixture_store();
        let records: Vec<VariantRecord> = [99, 100, 150, 200, 201]
            .into_iter()
            .enumerate()
            .map(|(ordinal, start)| fixture_variant("1", start, ordinal))
            .chain(std::iter::once(fixture_variant("2", 150, 99)))
            .collect();
        must(store.seed_fixture_variants(&records));

        let window = query(&[("chromosome", "1"), ("positionStart", "100"), ("positionEnd", "200")]);
        assert_eq!(must(store.count_matching(&window, None)), 3);

        let mut starts = Vec::new();
        must(store.fetch_matching(&window, None, &mut |record| {
            starts.push(record.start);
            Ok(())
        }));
        starts.sort_unstable();
        assert_eq!(starts, vec![100, 150, 200]);
    }

    #[test]
    fn nullable_columns_decode_to_absent_and_present() {
        let store = fixture_store();
        let mut annotated = fixture_variant("7", 117_559_590, 0);
        annotated.dbsnp = Nullable::present("rs113993960".to_string());
        annotated.af = Nullable::present(0.0123);
        annotated.ac = Nullable::present(17);
        annotated.gene_symbol = Nullable::present("CFTR".to_string());
        annotated.clinical_significance = Nullable::present("Pathogenic".to_string());
        let bare = fixture_variant("7", 117_559_591, 1);
        must(store.seed_fixture_variants(&[annotated.clone(), bare.clone()]));

        let window = query(&[
            ("chromosome", "7"),
            ("positionStart", "117559590"),
            ("positionEnd", "117559591"),
        ]);
        let page = match VariantReader::new(&store).read(&window) {
            Ok(page) => page,
            Err(err) => panic!("read failed: {err}"),
        };
        assert_eq!(page.total, 2);
        assert!(page.variants.contains(&annotated));
        assert!(page.variants.contains(&bare));
    }

    #[test]
    fn default_limit_caps_seven_hundred_matches_at_five_hundred() {
        let store = fixture_store();
        seed_window(&store, "1", 700);

        let window = query(&[("chromosome", "1"), ("positionStart", "100"), ("positionEnd", "200")]);
        let page = match VariantReader::new(&store).read(&window) {
            Ok(page) => page,
            Err(err) => panic!("read failed: {err}"),
        };
        assert_eq!(page.total, 700);
        assert_eq!(page.variants.len(), 500);
    }

    #[test]
    fn skip_past_total_returns_empty_page_with_total() {
        let store = fixture_store();
        seed_window(&store, "1", 700);

        let window = query(&[
            ("chromosome", "1"),
            ("positionStart", "100"),
            ("positionEnd", "200"),
            ("skip", "800"),
        ]);
        let page = match VariantReader::new(&store).read(&window) {
            Ok(page) => page,
            Err(err) => panic!("read failed: {err}"),
        };
        assert_eq!(page.total, 700);
        assert!(page.variants.is_empty());
    }

    #[test]
    fn empty_window_is_no_matches() {
        let store = fixture_store();
        seed_window(&store, "1", 10);

        let window = query(&[("chromosome", "1"), ("positionStart", "5000"), ("positionEnd", "6000")]);
        match VariantReader::new(&store).read(&window) {
            Ok(page) => panic!("expected no matches, got {page:?}"),
            Err(err) => {
                assert!(matches!(err, QueryError::NoMatches { .. }));
                assert_eq!(err.stage(), Stage::Count);
            }
        }
    }

    #[test]
    fn missing_table_surfaces_as_count_store_error() {
        let store = must(SqliteVariantStore::open(Path::new(":memory:")));
        let window = query(&[("chromosome", "1"), ("positionStart", "1"), ("positionEnd", "2")]);
        match VariantReader::new(&store).read(&window) {
            Ok(page) => panic!("expected store error, got {page:?}"),
            Err(QueryError::Store { stage, message }) => {
                assert_eq!(stage, Stage::Count);
                assert!(message.contains("no such table"), "unexpected message: {message}");
            }
            Err(other) => panic!("expected store error, got {other:?}"),
        }
    }

    #[test]
    fn running_count_is_interrupted_at_deadline() {
        let store = unbounded_store();
        let window = query(&[("chromosome", "1"), ("positionStart", "1"), ("positionEnd", "10")]);
        let started = Instant::now();
        let reader = VariantReader::new(&store).with_deadline(started + Duration::from_millis(50));

        match reader.count(&window) {
            Ok(total) => panic!("expected interrupted count, got {total}"),
            Err(QueryError::Store { stage, message }) => {
                assert_eq!(stage, Stage::Count);
                assert!(message.contains("interrupted"), "unexpected message: {message}");
            }
            Err(other) => panic!("expected store error, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5), "count ran for {:?}", started.elapsed());
    }

    #[test]
    fn running_fetch_is_interrupted_after_matching_rows() {
        let store = unbounded_store();
        let window = query(&[("chromosome", "1"), ("positionStart", "1"), ("positionEnd", "10")]);
        let started = Instant::now();
        let reader = VariantReader::new(&store).with_deadline(started + Duration::from_millis(50));

        match reader.fetch(&window, 10) {
            Ok(rows) => panic!("expected interrupted fetch, got {} rows", rows.len()),
            Err(QueryError::Store { stage, message }) => {
                assert_eq!(stage, Stage::Fetch);
                assert!(message.contains("interrupted"), "unexpected message: {message}");
            }
            Err(other) => panic!("expected store error, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5), "fetch ran for {:?}", started.elapsed());
    }

    #[test]
    fn interrupted_query_releases_the_connection() {
        let store = unbounded_store();
        let window = query(&[("chromosome", "1"), ("positionStart", "1"), ("positionEnd", "10")]);
        let deadline = Instant::now() + Duration::from_millis(100);

        std::thread::scope(|scope| {
            let slow = scope.spawn(|| VariantReader::new(&store).with_deadline(deadline).count(&window));
            std::thread::sleep(Duration::from_millis(20));

            let waiting = Instant::now();
            must(store.ping());
            let waited = waiting.elapsed();
            assert!(waited < Duration::from_secs(5), "next caller waited {waited:?}");

            match slow.join() {
                Ok(Err(QueryError::Store { stage: Stage::Count, .. })) => {}
                other => panic!("expected interrupted count, got {other:?}"),
            }
        });

        // The deadline is cleared with the guard; later statements run to completion.
        let conn = must(store.lock());
        let rows: i64 = match conn.query_row("SELECT COUNT(*) FROM (SELECT * FROM vs LIMIT 5000)", [], |row| row.get(0)) {
            Ok(rows) => rows,
            Err(err) => panic!("bounded scan failed after interruption: {err}"),
        };
        assert_eq!(rows, 5000);
    }

    #[test]
    fn sink_error_aborts_scan() {
        let store = fixture_store();
        seed_window(&store, "1", 20);
        let window = query(&[("chromosome", "1"), ("positionStart", "100"), ("positionEnd", "200")]);

        let mut seen = 0_usize;
        let result = store.fetch_matching(&window, None, &mut |_record| {
            seen += 1;
            if seen == 3 {
                anyhow::bail!("stop");
            }
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(seen, 3);
    }

    #[test]
    fn verify_schema_reports_missing_table_and_columns() {
        let store = must(SqliteVariantStore::open(Path::new(":memory:")));
        let missing_table = match store.verify_schema() {
            Ok(()) => panic!("expected missing table error"),
            Err(err) => err.to_string(),
        };
        assert!(missing_table.contains("expected table vs"), "{missing_table}");

        {
            let conn = must(store.lock());
            if let Err(err) = conn.execute_batch(
                "CREATE TABLE vs (variant_id TEXT, chromosome TEXT, start INTEGER, reference TEXT, alternate TEXT);",
            ) {
                panic!("failed to create legacy table: {err}");
            }
        }
        let missing_columns = match store.verify_schema() {
            Ok(()) => panic!("expected missing column error"),
            Err(err) => err.to_string(),
        };
        assert!(missing_columns.contains("vs.dbsnp"), "{missing_columns}");
        assert!(missing_columns.contains("exac_af"), "{missing_columns}");

        let complete = fixture_store();
        must(complete.verify_schema());
    }

    #[test]
    fn read_only_store_serves_queries_and_rejects_writes() {
        let db_path = std::env::temp_dir().join(format!("variant-store-ro-{}.sqlite3", ulid::Ulid::new()));
        {
            let writer = must(SqliteVariantStore::open(&db_path));
            must(writer.create_fixture_schema());
            seed_window(&writer, "X", 12);
        }

        let reader = must(SqliteVariantStore::open_read_only(&db_path));
        must(reader.ping());
        must(reader.verify_schema());
        let window = query(&[("chromosome", "X"), ("positionStart", "0"), ("positionEnd", "1000")]);
        assert_eq!(must(reader.count_matching(&window, None)), 12);
        assert!(reader.seed_fixture_variants(&[fixture_variant("X", 1, 999)]).is_err());

        drop(reader);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn open_read_only_fails_for_missing_database() {
        let db_path = std::env::temp_dir().join(format!("variant-store-missing-{}.sqlite3", ulid::Ulid::new()));
        assert!(SqliteVariantStore::open_read_only(&db_path).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_fetch_never_exceeds_limit_and_skips_rows(
            starts in prop::collection::vec(0i64..400, 1..120),
            limit in 0u64..50,
            skip in 0u64..150,
        ) {
            let store = fixture_store();
            let records: Vec<VariantRecord> = starts
                .iter()
                .enumerate()
                .map(|(ordinal, start)| fixture_variant("3", *start, ordinal))
                .collect();
            must(store.seed_fixture_variants(&records));

            let limit_raw = limit.to_string();
            let skip_raw = skip.to_string();
            let window = query(&[
                ("chromosome", "3"),
                ("positionStart", "100"),
                ("positionEnd", "300"),
                ("limit", limit_raw.as_str()),
                ("skip", skip_raw.as_str()),
            ]);
            let matching = starts.iter().filter(|start| (100..=300).contains(*start)).count() as u64;

            match VariantReader::new(&store).read(&window) {
                Ok(page) => {
                    prop_assert_eq!(page.total, matching);
                    prop_assert!(page.variants.len() as u64 <= limit);
                    prop_assert_eq!(
                        page.variants.len() as u64,
                        matching.saturating_sub(skip).min(limit)
                    );
                    prop_assert!(page.variants.iter().all(|row| (100..=300).contains(&row.start)));
                }
                Err(err) => {
                    prop_assert_eq!(matching, 0);
                    prop_assert!(
                        matches!(err, QueryError::NoMatches { .. }),
                        "expected no matches, got {:?}",
                        err
                    );
                }
            }
        }
    }
}
