//! Request kinds and their registry.
//!
//! Every kind binds a request payload, a response payload, and the store
//! schema both are written with. An [`Exchange`](crate::Exchange) resolves the
//! kinds it serves once, at construction, through a [`KindRegistry`]; using a
//! kind that was not registered is a protocol violation.

use crate::error::ProtocolError;
use crate::exchange::AsyncResultTable;
use crate::types::{KindTag, OperatingMode, Rank, ResultRow};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Relative tolerance used when comparing payloads.
pub const PAYLOAD_EPSILON: f64 = 1e-4;

/// Store layout of one request kind.
#[derive(Debug)]
pub struct KindSchema {
    pub tag: KindTag,
    pub request_table: &'static str,
    pub result_table: &'static str,
    pub request_columns: &'static [&'static str],
    pub result_columns: &'static [&'static str],
}

impl KindSchema {
    pub fn request_width(&self) -> usize {
        self.request_columns.len()
    }

    pub fn result_width(&self) -> usize {
        self.result_columns.len()
    }
}

const BGK_REQUEST_COLUMNS: &[&str] = &[
    "TEMPERATURE",
    "DENSITY_0",
    "DENSITY_1",
    "DENSITY_2",
    "DENSITY_3",
    "CHARGES_0",
    "CHARGES_1",
    "CHARGES_2",
    "CHARGES_3",
];

const BGK_MASSES_REQUEST_COLUMNS: &[&str] = &[
    "TEMPERATURE",
    "DENSITY_0",
    "DENSITY_1",
    "DENSITY_2",
    "DENSITY_3",
    "CHARGES_0",
    "CHARGES_1",
    "CHARGES_2",
    "CHARGES_3",
    "MASSES_0",
    "MASSES_1",
    "MASSES_2",
    "MASSES_3",
];

const BGK_RESULT_COLUMNS: &[&str] = &[
    "VISCOSITY",
    "THERMAL_CONDUCT",
    "DIFFCOEFF_0",
    "DIFFCOEFF_1",
    "DIFFCOEFF_2",
    "DIFFCOEFF_3",
    "DIFFCOEFF_4",
    "DIFFCOEFF_5",
    "DIFFCOEFF_6",
    "DIFFCOEFF_7",
    "DIFFCOEFF_8",
    "DIFFCOEFF_9",
];

pub static BGK_SCHEMA: KindSchema = KindSchema {
    tag: KindTag::Bgk,
    request_table: "BGKREQS",
    result_table: "BGKRESULTS",
    request_columns: BGK_REQUEST_COLUMNS,
    result_columns: BGK_RESULT_COLUMNS,
};

pub static BGK_MASSES_SCHEMA: KindSchema = KindSchema {
    tag: KindTag::BgkMasses,
    request_table: "BGKMASSESREQS",
    result_table: "BGKMASSESRESULTS",
    request_columns: BGK_MASSES_REQUEST_COLUMNS,
    result_columns: BGK_RESULT_COLUMNS,
};

pub static LBM_SCHEMA: KindSchema = KindSchema {
    tag: KindTag::LbmToOneDmd,
    request_table: "LBMTOONEDMDREQS",
    result_table: "LBMTOONEDMDRESULTS",
    request_columns: &["DISTANCE", "DENSITY", "TEMPERATURE"],
    result_columns: &["ADSORPTION"],
};

impl KindTag {
    pub fn schema(self) -> &'static KindSchema {
        match self {
            KindTag::Bgk => &BGK_SCHEMA,
            KindTag::BgkMasses => &BGK_MASSES_SCHEMA,
            KindTag::LbmToOneDmd => &LBM_SCHEMA,
        }
    }
}

/// Binds a request payload type to its response type and store schema.
pub trait Kind: Send + Sync + 'static {
    const TAG: KindTag;

    type Request: Clone + Debug + Send + Sync + 'static;
    type Response: Clone + Debug + Send + Sync + 'static;

    fn request_fields(request: &Self::Request) -> Vec<f64>;

    /// `fields` has exactly `schema().request_width()` entries.
    fn request_from_fields(fields: &[f64]) -> Self::Request;

    fn response_fields(response: &Self::Response) -> Vec<f64>;

    /// `fields` has exactly `schema().result_width()` entries.
    fn response_from_fields(fields: &[f64], provenance: OperatingMode) -> Self::Response;

    fn provenance(response: &Self::Response) -> OperatingMode;

    fn schema() -> &'static KindSchema {
        Self::TAG.schema()
    }

    /// Request sent to stop the oracle: every field is `-0.0`.
    fn kill_request() -> Self::Request {
        Self::request_from_fields(&vec![-0.0; Self::schema().request_width()])
    }

    fn decode_request(fields: &[f64]) -> Result<Self::Request, ProtocolError> {
        check_width(Self::schema().request_width(), fields.len())?;
        Ok(Self::request_from_fields(fields))
    }

    fn decode_response(row: &ResultRow) -> Result<Self::Response, ProtocolError> {
        check_width(Self::schema().result_width(), row.fields.len())?;
        Ok(Self::response_from_fields(&row.fields, row.mode()?))
    }
}

fn check_width(expected: usize, found: usize) -> Result<(), ProtocolError> {
    if expected == found {
        Ok(())
    } else {
        Err(ProtocolError::FieldCount { expected, found })
    }
}

fn rel_close(lhs: f64, rhs: f64) -> bool {
    if rhs == 0.0 {
        (lhs - rhs).abs() <= PAYLOAD_EPSILON
    } else {
        ((lhs - rhs) / rhs).abs() <= PAYLOAD_EPSILON
    }
}

fn all_close(lhs: &[f64], rhs: &[f64]) -> bool {
    lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(l, r)| rel_close(*l, *r))
}

/// BGK transport coefficient request.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BgkRequest {
    pub temperature: f64,
    pub density: [f64; 4],
    pub charges: [f64; 4],
}

impl BgkRequest {
    /// Field-wise equality within [`PAYLOAD_EPSILON`], relative to `other`.
    pub fn approx_eq(&self, other: &Self) -> bool {
        all_close(&Bgk::request_fields(self), &Bgk::request_fields(other))
    }
}

/// BGK transport coefficients, shared by [`Bgk`] and [`BgkMasses`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BgkResponse {
    pub viscosity: f64,
    pub thermal_conductivity: f64,
    pub diffusion_coefficient: [f64; 10],
    pub provenance: OperatingMode,
}

impl BgkResponse {
    /// Field-wise equality within [`PAYLOAD_EPSILON`]; provenance is ignored.
    pub fn approx_eq(&self, other: &Self) -> bool {
        all_close(&bgk_response_fields(self), &bgk_response_fields(other))
    }
}

/// BGK request where species are identified by mass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BgkMassesRequest {
    pub temperature: f64,
    pub density: [f64; 4],
    pub charges: [f64; 4],
    pub masses: [f64; 4],
}

/// LBM to 1-D MD adsorption request.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LbmRequest {
    pub distance: f64,
    pub density: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LbmResponse {
    pub adsorption: f64,
    pub provenance: OperatingMode,
}

fn array<const N: usize>(fields: &[f64]) -> [f64; N] {
    let mut out = [0.0; N];
    out.copy_from_slice(&fields[..N]);
    out
}

fn bgk_response_fields(r: &BgkResponse) -> Vec<f64> {
    let mut fields = Vec::with_capacity(12);
    fields.push(r.viscosity);
    fields.push(r.thermal_conductivity);
    fields.extend_from_slice(&r.diffusion_coefficient);
    fields
}

fn bgk_response_from_fields(fields: &[f64], provenance: OperatingMode) -> BgkResponse {
    BgkResponse {
        viscosity: fields[0],
        thermal_conductivity: fields[1],
        diffusion_coefficient: array(&fields[2..12]),
        provenance,
    }
}

/// Marker for BGK requests.
pub struct Bgk;

impl Kind for Bgk {
    const TAG: KindTag = KindTag::Bgk;
    type Request = BgkRequest;
    type Response = BgkResponse;

    fn request_fields(r: &BgkRequest) -> Vec<f64> {
        let mut fields = Vec::with_capacity(9);
        fields.push(r.temperature);
        fields.extend_from_slice(&r.density);
        fields.extend_from_slice(&r.charges);
        fields
    }

    fn request_from_fields(fields: &[f64]) -> BgkRequest {
        BgkRequest {
            temperature: fields[0],
            density: array(&fields[1..5]),
            charges: array(&fields[5..9]),
        }
    }

    fn response_fields(r: &BgkResponse) -> Vec<f64> {
        bgk_response_fields(r)
    }

    fn response_from_fields(fields: &[f64], provenance: OperatingMode) -> BgkResponse {
        bgk_response_from_fields(fields, provenance)
    }

    fn provenance(r: &BgkResponse) -> OperatingMode {
        r.provenance
    }
}

/// Marker for BGK requests with species masses.
pub struct BgkMasses;

impl Kind for BgkMasses {
    const TAG: KindTag = KindTag::BgkMasses;
    type Request = BgkMassesRequest;
    type Response = BgkResponse;

    fn request_fields(r: &BgkMassesRequest) -> Vec<f64> {
        let mut fields = Vec::with_capacity(13);
        fields.push(r.temperature);
        fields.extend_from_slice(&r.density);
        fields.extend_from_slice(&r.charges);
        fields.extend_from_slice(&r.masses);
        fields
    }

    fn request_from_fields(fields: &[f64]) -> BgkMassesRequest {
        BgkMassesRequest {
            temperature: fields[0],
            density: array(&fields[1..5]),
            charges: array(&fields[5..9]),
            masses: array(&fields[9..13]),
        }
    }

    fn response_fields(r: &BgkResponse) -> Vec<f64> {
        bgk_response_fields(r)
    }

    fn response_from_fields(fields: &[f64], provenance: OperatingMode) -> BgkResponse {
        bgk_response_from_fields(fields, provenance)
    }

    fn provenance(r: &BgkResponse) -> OperatingMode {
        r.provenance
    }
}

/// Marker for LBM adsorption requests.
pub struct LbmToOneDmd;

impl Kind for LbmToOneDmd {
    const TAG: KindTag = KindTag::LbmToOneDmd;
    type Request = LbmRequest;
    type Response = LbmResponse;

    fn request_fields(r: &LbmRequest) -> Vec<f64> {
        vec![r.distance, r.density, r.temperature]
    }

    fn request_from_fields(fields: &[f64]) -> LbmRequest {
        LbmRequest {
            distance: fields[0],
            density: fields[1],
            temperature: fields[2],
        }
    }

    fn response_fields(r: &LbmResponse) -> Vec<f64> {
        vec![r.adsorption]
    }

    fn response_from_fields(fields: &[f64], provenance: OperatingMode) -> LbmResponse {
        LbmResponse {
            adsorption: fields[0],
            provenance,
        }
    }

    fn provenance(r: &LbmResponse) -> OperatingMode {
        r.provenance
    }
}

/// Per-kind state resolved at construction: schema plus result tables.
#[derive(Debug)]
pub struct KindBinding {
    schema: &'static KindSchema,
    global: Arc<AsyncResultTable<ResultRow>>,
    per_rank: RwLock<Vec<Arc<AsyncResultTable<ResultRow>>>>,
}

impl KindBinding {
    fn new(tag: KindTag) -> Self {
        Self {
            schema: tag.schema(),
            global: Arc::new(AsyncResultTable::new()),
            per_rank: RwLock::new(Vec::new()),
        }
    }

    pub fn schema(&self) -> &'static KindSchema {
        self.schema
    }

    /// Table for process-global ids (single and batch requests).
    pub fn global_table(&self) -> &Arc<AsyncResultTable<ResultRow>> {
        &self.global
    }

    /// Table for ids allocated on behalf of `rank`, created on first use.
    pub fn rank_table(&self, rank: Rank) -> Arc<AsyncResultTable<ResultRow>> {
        let slot = rank as usize;
        if let Some(table) = self.per_rank.read().get(slot) {
            return table.clone();
        }
        let mut tables = self.per_rank.write();
        while tables.len() <= slot {
            tables.push(Arc::new(AsyncResultTable::new()));
        }
        tables[slot].clone()
    }
}

/// Registry of the kinds an exchange serves.
#[derive(Debug, Default)]
pub struct KindRegistry {
    bindings: HashMap<KindTag, KindBinding>,
}

impl KindRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry serving every known kind.
    pub fn with_all_kinds() -> Self {
        KindTag::ALL
            .into_iter()
            .fold(Self::new(), |registry, tag| registry.with_kind(tag))
    }

    /// Register `tag`. Registering twice keeps the existing tables.
    pub fn with_kind(mut self, tag: KindTag) -> Self {
        self.bindings
            .entry(tag)
            .or_insert_with(|| KindBinding::new(tag));
        self
    }

    pub fn get(&self, tag: KindTag) -> Result<&KindBinding, ProtocolError> {
        self.bindings
            .get(&tag)
            .ok_or(ProtocolError::UnsupportedKind(tag.name()))
    }

    /// Schemas of every registered kind.
    pub fn schemas(&self) -> impl Iterator<Item = &'static KindSchema> + '_ {
        self.bindings.values().map(|b| b.schema)
    }
}
