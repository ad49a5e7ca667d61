//! Query model for the variant store.
//!
//! The request pipeline is split into three pure pieces plus one seam:
//! - [`QueryParams`] and [`QueryDescriptor::from_params`] validate the raw URL
//!   parameters into a descriptor, aggregating every required-field failure.
//! - [`VariantReader`] runs the count phase and then the fetch phase against a
//!   [`VariantSource`], the only place the backing store is touched.
//! - [`VariantResponse`] assembles the JSON envelope returned to clients.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const PARAM_CHROMOSOME: &str = "chromosome";
pub const PARAM_POSITION_START: &str = "positionStart";
pub const PARAM_POSITION_END: &str = "positionEnd";
pub const PARAM_LIMIT: &str = "limit";
pub const PARAM_SKIP: &str = "skip";

pub const DEFAULT_LIMIT: u64 = 500;
pub const DEFAULT_SKIP: u64 = 0;

/// A scalar that is either present or explicitly absent.
///
/// Serializes to the raw value when present and to JSON `null` when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nullable<T>(Option<T>);

pub type NullableString = Nullable<String>;
pub type NullableFloat = Nullable<f64>;
pub type NullableInt = Nullable<i64>;

impl<T> Nullable<T> {
    #[must_use]
    pub const fn absent() -> Self {
        Self(None)
    }

    #[must_use]
    pub const fn present(value: T) -> Self {
        Self(Some(value))
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.0.is_some()
    }

    #[must_use]
    pub const fn as_option(&self) -> Option<&T> {
        self.0.as_ref()
    }

    #[must_use]
    pub fn into_option(self) -> Option<T> {
        self.0
    }
}

impl<T> Default for Nullable<T> {
    fn default() -> Self {
        Self::absent()
    }
}

impl<T> From<Option<T>> for Nullable<T> {
    fn from(value: Option<T>) -> Self {
        Self(value)
    }
}

impl<T> From<Nullable<T>> for Option<T> {
    fn from(value: Nullable<T>) -> Self {
        value.0
    }
}

impl<T: Serialize> Serialize for Nullable<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match &self.0 {
            Some(value) => value.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Nullable<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Self)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ParamError {
    #[error("Could not parse {name}")]
    MissingParameter { name: String },
    #[error("Could not parse {name} as an integer: {value:?}")]
    InvalidNumber { name: String, value: String },
    #[error("{name} must not be negative: {value}")]
    NegativeValue { name: String, value: i64 },
}

/// Every required-parameter failure of one request, in parameter order.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{}", join_failures(.failures))]
pub struct ValidationError {
    failures: Vec<ParamError>,
}

impl ValidationError {
    #[must_use]
    pub fn failures(&self) -> &[ParamError] {
        &self.failures
    }
}

fn join_failures(failures: &[ParamError]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Pipeline phase a failure is attributed to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Stage {
    Parsing,
    Count,
    Fetch,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parsing => "parsing",
            Self::Count => "count",
            Self::Fetch => "fetch",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Parsing => "Parsing Error",
            Self::Count => "Count Error",
            Self::Fetch => "Fetch Error",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    MalformedQuery(String),
    #[error("no variants found on chromosome {chromosome} between {position_start} and {position_end}")]
    NoMatches { chromosome: String, position_start: u64, position_end: u64 },
    #[error("{message}")]
    Store { stage: Stage, message: String },
}

impl QueryError {
    #[must_use]
    pub fn store(stage: Stage, message: impl Into<String>) -> Self {
        Self::Store { stage, message: message.into() }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Validation(_) | Self::MalformedQuery(_) => Stage::Parsing,
            Self::NoMatches { .. } => Stage::Count,
            Self::Store { stage, .. } => *stage,
        }
    }
}

/// URL query parameters, keeping every value supplied for a name in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    values: BTreeMap<String, Vec<String>>,
}

impl QueryParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.entry(name.into()).or_default().push(value.into());
    }

    #[must_use]
    pub fn values(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// First value supplied for `name`.
    pub fn require_string(&self, name: &str) -> Result<&str, ParamError> {
        match self.values(name).first() {
            Some(value) => Ok(value.as_str()),
            None => Err(ParamError::MissingParameter { name: name.to_string() }),
        }
    }

    /// Like [`QueryParams::require_string`], but an empty first value also
    /// counts as missing.
    pub fn require_non_empty(&self, name: &str) -> Result<&str, ParamError> {
        match self.require_string(name)? {
            "" => Err(ParamError::MissingParameter { name: name.to_string() }),
            value => Ok(value),
        }
    }

    pub fn require_natural(&self, name: &str) -> Result<u64, ParamError> {
        let raw = self.require_string(name)?;
        let parsed = raw.parse::<i64>().map_err(|_| ParamError::InvalidNumber {
            name: name.to_string(),
            value: raw.to_string(),
        })?;
        u64::try_from(parsed)
            .map_err(|_| ParamError::NegativeValue { name: name.to_string(), value: parsed })
    }

    /// Like [`QueryParams::require_natural`], but any failure yields `default`.
    ///
    /// Malformed values are not reported; `limit=abc` behaves like no limit.
    #[must_use]
    pub fn optional_natural(&self, name: &str, default: u64) -> u64 {
        self.require_natural(name).unwrap_or(default)
    }
}

impl<K, V> FromIterator<(K, V)> for QueryParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// Validated filter and pagination for one request.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    chromosome: String,
    position_start: u64,
    position_end: u64,
    limit: u64,
    skip: u64,
}

impl QueryDescriptor {
    /// Validates `params` into a descriptor.
    ///
    /// # Errors
    /// Returns [`ValidationError`] carrying one entry per failed required
    /// parameter. `limit` and `skip` never fail; they fall back to
    /// [`DEFAULT_LIMIT`] and [`DEFAULT_SKIP`].
    pub fn from_params(params: &QueryParams) -> Result<Self, ValidationError> {
        let mut failures = Vec::new();
        let chromosome = track(&mut failures, params.require_non_empty(PARAM_CHROMOSOME));
        let position_start = track(&mut failures, params.require_natural(PARAM_POSITION_START));
        let position_end = track(&mut failures, params.require_natural(PARAM_POSITION_END));
        let limit = params.optional_natural(PARAM_LIMIT, DEFAULT_LIMIT);
        let skip = params.optional_natural(PARAM_SKIP, DEFAULT_SKIP);

        match (chromosome, position_start, position_end) {
            (Some(chromosome), Some(position_start), Some(position_end)) if failures.is_empty() => {
                Ok(Self {
                    chromosome: chromosome.to_string(),
                    position_start,
                    position_end,
                    limit,
                    skip,
                })
            }
            _ => Err(ValidationError { failures }),
        }
    }

    #[must_use]
    pub fn chromosome(&self) -> &str {
        &self.chromosome
    }

    #[must_use]
    pub fn position_start(&self) -> u64 {
        self.position_start
    }

    #[must_use]
    pub fn position_end(&self) -> u64 {
        self.position_end
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn skip(&self) -> u64 {
        self.skip
    }

    /// Row filter shared by the count and fetch phases.
    ///
    /// Only `start` is compared and both bounds are inclusive.
    #[must_use]
    pub fn matches(&self, chromosome: &str, start: i64) -> bool {
        chromosome == self.chromosome
            && u64::try_from(start)
                .is_ok_and(|start| start <= self.position_end && start >= self.position_start)
    }

    fn no_matches(&self) -> QueryError {
        QueryError::NoMatches {
            chromosome: self.chromosome.clone(),
            position_start: self.position_start,
            position_end: self.position_end,
        }
    }
}

fn track<T>(failures: &mut Vec<ParamError>, result: Result<T, ParamError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            failures.push(err);
            None
        }
    }
}

/// Shorthand for [`QueryDescriptor::from_params`].
pub fn validate(params: &QueryParams) -> Result<QueryDescriptor, ValidationError> {
    QueryDescriptor::from_params(params)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariantRecord {
    pub variant_id: String,
    pub chromosome: String,
    pub start: i64,
    pub reference: String,
    pub alternate: String,
    #[serde(rename = "dbSNP")]
    pub dbsnp: NullableString,
    pub call_rate: NullableFloat,
    #[serde(rename = "AC")]
    pub ac: NullableInt,
    #[serde(rename = "AF")]
    pub af: NullableFloat,
    pub n_called: NullableInt,
    pub n_not_called: NullableInt,
    pub n_hom_ref: NullableInt,
    pub n_het: NullableInt,
    pub n_hom_var: NullableInt,
    pub gene_symbol: NullableString,
    pub gene_id: NullableString,
    pub consequence: NullableString,
    pub impact: NullableString,
    pub hgvs_c: NullableString,
    pub hgvs_p: NullableString,
    pub clinvar_id: NullableString,
    pub clinical_significance: NullableString,
    pub cadd_phred: NullableFloat,
    #[serde(rename = "gnomadAF")]
    pub gnomad_af: NullableFloat,
    #[serde(rename = "gnomadAfrAF")]
    pub gnomad_afr_af: NullableFloat,
    #[serde(rename = "gnomadAmrAF")]
    pub gnomad_amr_af: NullableFloat,
    #[serde(rename = "gnomadEasAF")]
    pub gnomad_eas_af: NullableFloat,
    #[serde(rename = "gnomadNfeAF")]
    pub gnomad_nfe_af: NullableFloat,
    #[serde(rename = "gnomadSasAF")]
    pub gnomad_sas_af: NullableFloat,
    #[serde(rename = "exacAF")]
    pub exac_af: NullableFloat,
}

impl VariantRecord {
    /// A record with its identity set and every annotation absent.
    #[must_use]
    pub fn new(
        variant_id: impl Into<String>,
        chromosome: impl Into<String>,
        start: i64,
        reference: impl Into<String>,
        alternate: impl Into<String>,
    ) -> Self {
        Self {
            variant_id: variant_id.into(),
            chromosome: chromosome.into(),
            start,
            reference: reference.into(),
            alternate: alternate.into(),
            dbsnp: Nullable::absent(),
            call_rate: Nullable::absent(),
            ac: Nullable::absent(),
            af: Nullable::absent(),
            n_called: Nullable::absent(),
            n_not_called: Nullable::absent(),
            n_hom_ref: Nullable::absent(),
            n_het: Nullable::absent(),
            n_hom_var: Nullable::absent(),
            gene_symbol: Nullable::absent(),
            gene_id: Nullable::absent(),
            consequence: Nullable::absent(),
            impact: Nullable::absent(),
            hgvs_c: Nullable::absent(),
            hgvs_p: Nullable::absent(),
            clinvar_id: Nullable::absent(),
            clinical_significance: Nullable::absent(),
            cadd_phred: Nullable::absent(),
            gnomad_af: Nullable::absent(),
            gnomad_afr_af: Nullable::absent(),
            gnomad_amr_af: Nullable::absent(),
            gnomad_eas_af: Nullable::absent(),
            gnomad_nfe_af: Nullable::absent(),
            gnomad_sas_af: Nullable::absent(),
            exac_af: Nullable::absent(),
        }
    }
}

/// Backing store consulted by [`VariantReader`].
///
/// Implementations apply [`QueryDescriptor::matches`] semantics. Neither
/// method retries. When `deadline` is set, a round trip still running once it
/// passes must be aborted and reported as an error.
pub trait VariantSource: Send + Sync {
    /// Number of rows matching the descriptor's filter, ignoring pagination.
    #[allow(clippy::missing_errors_doc)]
    fn count_matching(&self, query: &QueryDescriptor, deadline: Option<Instant>) -> anyhow::Result<i64>;

    /// Streams the matching rows after skipping `query.skip()` of them, at
    /// most `query.limit()` rows, in store order.
    ///
    /// An error returned by `sink` aborts the scan and is propagated.
    #[allow(clippy::missing_errors_doc)]
    fn fetch_matching(
        &self,
        query: &QueryDescriptor,
        deadline: Option<Instant>,
        sink: &mut dyn FnMut(VariantRecord) -> anyhow::Result<()>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantPage {
    pub total: u64,
    pub variants: Vec<VariantRecord>,
}

/// Two-phase count-then-fetch reader over a [`VariantSource`].
pub struct VariantReader<'a, S: ?Sized> {
    source: &'a S,
    deadline: Option<Instant>,
}

impl<'a, S> VariantReader<'a, S>
where
    S: VariantSource + ?Sized,
{
    #[must_use]
    pub fn new(source: &'a S) -> Self {
        Self { source, deadline: None }
    }

    /// Abandons the running phase once `deadline` has passed.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Count phase.
    ///
    /// # Errors
    /// [`QueryError::Store`] when the source fails or the deadline passes,
    /// [`QueryError::NoMatches`] when the count is not positive.
    pub fn count(&self, query: &QueryDescriptor) -> Result<u64, QueryError> {
        self.check_deadline(Stage::Count)?;
        let total = self
            .source
            .count_matching(query, self.deadline)
            .map_err(|err| QueryError::store(Stage::Count, format!("{err:#}")))?;

        // A zero count is a failure, not an empty page.
        match u64::try_from(total) {
            Ok(total) if total > 0 => Ok(total),
            _ => Err(query.no_matches()),
        }
    }

    /// Fetch phase. `total` comes from [`VariantReader::count`] and is only
    /// used to pre-size the result.
    ///
    /// # Errors
    /// [`QueryError::Store`] when the source fails mid-scan or the deadline
    /// passes. No partial page is returned.
    pub fn fetch(&self, query: &QueryDescriptor, total: u64) -> Result<Vec<VariantRecord>, QueryError> {
        self.check_deadline(Stage::Fetch)?;
        let deadline = self.deadline;
        let mut variants = Vec::with_capacity(expected_page_len(total, query.skip(), query.limit()));
        self.source
            .fetch_matching(query, deadline, &mut |record| {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    anyhow::bail!("operation deadline exceeded");
                }
                variants.push(record);
                Ok(())
            })
            .map_err(|err| QueryError::store(Stage::Fetch, format!("{err:#}")))?;
        Ok(variants)
    }

    /// Runs [`VariantReader::count`] then [`VariantReader::fetch`].
    ///
    /// # Errors
    /// The first error of either phase.
    pub fn read(&self, query: &QueryDescriptor) -> Result<VariantPage, QueryError> {
        let total = self.count(query)?;
        let variants = self.fetch(query, total)?;
        Ok(VariantPage { total, variants })
    }

    fn check_deadline(&self, stage: Stage) -> Result<(), QueryError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(QueryError::store(stage, "operation deadline exceeded"))
            }
            _ => Ok(()),
        }
    }
}

/// `clamp(total - skip, 0, limit)`.
#[must_use]
pub fn expected_page_len(total: u64, skip: u64, limit: u64) -> usize {
    usize::try_from(total.saturating_sub(skip).min(limit)).unwrap_or(0)
}

/// Response body of `GET /variants`.
///
/// `total` is a one-element list on success and empty on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantResponse {
    pub success: bool,
    pub variants: Vec<VariantRecord>,
    pub total: Vec<u64>,
    pub error: String,
}

impl VariantResponse {
    #[must_use]
    pub fn from_page(page: VariantPage) -> Self {
        Self { success: true, variants: page.variants, total: vec![page.total], error: String::new() }
    }

    #[must_use]
    pub fn from_error(err: &QueryError) -> Self {
        Self {
            success: false,
            variants: Vec::new(),
            total: Vec::new(),
            error: format!("Errors: {}: {err}", err.stage().label()),
        }
    }

    #[must_use]
    pub fn from_result(result: &Result<VariantPage, QueryError>) -> Self {
        match result {
            Ok(page) => Self::from_page(page.clone()),
            Err(err) => Self::from_error(err),
        }
    }
}
