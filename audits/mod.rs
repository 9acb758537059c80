/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Opportunity audits and the boundary that isolates their failures.
//!
//! Every audit reads from one [`ComputedArtifacts`] per page load. The
//! context builds the dependency graph, the network analysis, the simulator
//! and the metrics lazily and at most once, so audits that run side by side
//! share them without recomputing. Audits never mutate shared artifacts;
//! what-if graphs are always clones.

use std::sync::OnceLock;

use log::{info, warn};
use serde::Serialize;

use crate::builder::{PageGraph, build_page_graph};
use crate::config::{Settings, ThrottlingMethod};
use crate::graph::GraphError;
use crate::metrics::{
    FirstContentfulPaint, Interactive, LanternMetric, LargestContentfulPaint, MetricError,
    MetricResult, MetricValue, observed_first_contentful_paint, observed_interactive,
    observed_largest_contentful_paint,
};
use crate::model::{NetworkRequest, ProcessedTrace};
use crate::simulator::{NetworkAnalysis, SimulationError, Simulator};

pub mod byte_efficiency;
pub mod render_blocking_resources;
pub mod scoring;
pub mod unminified_css;
pub mod uses_rel_preconnect;
pub mod uses_rel_preload;

pub use byte_efficiency::{ByteEfficiencyResult, compute_waste_with_graph, compute_waste_with_tti_graph};
pub use render_blocking_resources::RenderBlockingResources;
pub use scoring::score_for_wasted_ms;
pub use unminified_css::UnminifiedCss;
pub use uses_rel_preconnect::UsesRelPreconnect;
pub use uses_rel_preload::UsesRelPreload;

#[derive(Debug, Clone, PartialEq)]
pub enum AuditError {
    Graph(GraphError),
    Simulation(SimulationError),
    Metric(MetricError),
    Message(String),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::Graph(e) => write!(f, "Dependency graph error: {e}"),
            AuditError::Simulation(e) => write!(f, "Simulation error: {e}"),
            AuditError::Metric(e) => write!(f, "Metric error: {e}"),
            AuditError::Message(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<GraphError> for AuditError {
    fn from(e: GraphError) -> Self {
        AuditError::Graph(e)
    }
}

impl From<SimulationError> for AuditError {
    fn from(e: SimulationError) -> Self {
        AuditError::Simulation(e)
    }
}

impl From<MetricError> for AuditError {
    fn from(e: MetricError) -> Self {
        AuditError::Metric(e)
    }
}

/// A stylesheet as served, for audits that inspect CSS text.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Stylesheet {
    /// Empty for inline `<style>` blocks.
    pub url: String,
    pub content: String,
}

/// Everything captured from one page load.
#[derive(Debug, Clone, Default)]
pub struct PageLoad {
    pub trace: ProcessedTrace,
    pub records: Vec<NetworkRequest>,
    /// URL the navigation ended on, after redirects.
    pub final_url: Option<String>,
    pub stylesheets: Vec<Stylesheet>,
    pub settings: Settings,
}

/// Which metric an audit wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    FirstContentfulPaint,
    LargestContentfulPaint,
    Interactive,
}

/// Lazily computed, shared artifacts for one page load.
pub struct ComputedArtifacts<'a> {
    page_load: &'a PageLoad,
    page_graph: OnceLock<Result<PageGraph, AuditError>>,
    network_analysis: OnceLock<NetworkAnalysis>,
    simulator: OnceLock<Result<Simulator, AuditError>>,
    first_contentful_paint: OnceLock<Result<MetricResult, AuditError>>,
    largest_contentful_paint: OnceLock<Result<MetricResult, AuditError>>,
    interactive: OnceLock<Result<MetricResult, AuditError>>,
}

impl<'a> ComputedArtifacts<'a> {
    pub fn new(page_load: &'a PageLoad) -> Self {
        Self {
            page_load,
            page_graph: OnceLock::new(),
            network_analysis: OnceLock::new(),
            simulator: OnceLock::new(),
            first_contentful_paint: OnceLock::new(),
            largest_contentful_paint: OnceLock::new(),
            interactive: OnceLock::new(),
        }
    }

    pub fn page_load(&self) -> &'a PageLoad {
        self.page_load
    }

    pub fn trace(&self) -> &'a ProcessedTrace {
        &self.page_load.trace
    }

    pub fn records(&self) -> &'a [NetworkRequest] {
        &self.page_load.records
    }

    pub fn settings(&self) -> &'a Settings {
        &self.page_load.settings
    }

    pub fn page_graph(&self) -> Result<&PageGraph, AuditError> {
        self.page_graph
            .get_or_init(|| {
                Ok(build_page_graph(
                    &self.page_load.trace,
                    &self.page_load.records,
                    self.page_load.final_url.as_deref(),
                )?)
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn network_analysis(&self) -> &NetworkAnalysis {
        self.network_analysis.get_or_init(|| {
            let records: Vec<&NetworkRequest> = self.page_load.records.iter().collect();
            NetworkAnalysis::analyze(&records)
        })
    }

    pub fn simulator(&self) -> Result<&Simulator, AuditError> {
        self.simulator
            .get_or_init(|| Ok(Simulator::from_settings(&self.page_load.settings, self.network_analysis())?))
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn first_contentful_paint(&self) -> Result<&MetricResult, AuditError> {
        let result = self.first_contentful_paint.get_or_init(|| {
            let page = self.page_graph()?;
            let simulator = self.simulator()?;
            Ok(FirstContentfulPaint.compute(page, self.trace(), simulator)?)
        });
        result.as_ref().map_err(Clone::clone)
    }

    pub fn largest_contentful_paint(&self) -> Result<&MetricResult, AuditError> {
        let result = self.largest_contentful_paint.get_or_init(|| {
            let first_contentful_paint = self.first_contentful_paint()?;
            let page = self.page_graph()?;
            let simulator = self.simulator()?;
            Ok(LargestContentfulPaint.compute_with_floor(page, self.trace(), simulator, first_contentful_paint)?)
        });
        result.as_ref().map_err(Clone::clone)
    }

    /// Floored by LCP, or by FCP when the trace has no LCP.
    pub fn interactive(&self) -> Result<&MetricResult, AuditError> {
        let result = self.interactive.get_or_init(|| {
            let floor = match self.largest_contentful_paint() {
                Ok(lcp) => lcp,
                Err(AuditError::Metric(MetricError::NoLargestContentfulPaint)) => self.first_contentful_paint()?,
                Err(e) => return Err(e),
            };
            let page = self.page_graph()?;
            let simulator = self.simulator()?;
            Ok(Interactive::floored_by(floor).compute_with_floor(page, self.trace(), simulator)?)
        });
        result.as_ref().map_err(Clone::clone)
    }

    /// The metric as the throttling method dictates: read from the trace
    /// when throttling was provided, simulated otherwise.
    pub fn metric(&self, kind: MetricKind) -> Result<MetricValue, AuditError> {
        let trace = self.trace();
        if self.settings().throttling_method == ThrottlingMethod::Provided {
            let timing = match kind {
                MetricKind::FirstContentfulPaint => observed_first_contentful_paint(trace)?,
                MetricKind::LargestContentfulPaint => observed_largest_contentful_paint(trace)?,
                MetricKind::Interactive => observed_interactive(trace)?,
            };
            return Ok(MetricValue::Observed(timing));
        }
        let result = match kind {
            MetricKind::FirstContentfulPaint => self.first_contentful_paint()?,
            MetricKind::LargestContentfulPaint => self.largest_contentful_paint()?,
            MetricKind::Interactive => self.interactive()?,
        };
        Ok(MetricValue::Simulated(Box::new(result.clone())))
    }
}

/// Column metadata for rendering opportunity tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Heading {
    pub key: &'static str,
    pub value_type: &'static str,
    pub label: &'static str,
}

pub const URL_HEADING: Heading = Heading {
    key: "url",
    value_type: "url",
    label: "URL",
};
pub const TOTAL_BYTES_HEADING: Heading = Heading {
    key: "totalBytes",
    value_type: "bytes",
    label: "Transfer Size",
};
pub const WASTED_BYTES_HEADING: Heading = Heading {
    key: "wastedBytes",
    value_type: "bytes",
    label: "Potential Savings",
};
pub const WASTED_MS_HEADING: Heading = Heading {
    key: "wastedMs",
    value_type: "timespanMs",
    label: "Potential Savings",
};

/// One row of an opportunity table.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityItem {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wasted_bytes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wasted_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wasted_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityDetails {
    pub headings: Vec<Heading>,
    pub items: Vec<OpportunityItem>,
    pub overall_savings_ms: f64,
    pub overall_savings_bytes: f64,
}

/// What a successful audit reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditProduct {
    pub score: f64,
    /// Milliseconds saved.
    pub numeric_value: f64,
    pub display_value: Option<String>,
    pub details: OpportunityDetails,
    pub warnings: Vec<String>,
}

impl AuditProduct {
    /// An opportunity scored by the milliseconds it would save.
    pub fn opportunity(wasted_ms: f64, details: OpportunityDetails, warnings: Vec<String>) -> Self {
        let display_value = (wasted_ms > 0.0).then(|| format!("Potential savings of {wasted_ms:.0} ms"));
        Self {
            score: score_for_wasted_ms(wasted_ms),
            numeric_value: wasted_ms,
            display_value,
            details,
            warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AuditOutcome {
    Scored(AuditProduct),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditResult {
    pub id: &'static str,
    pub outcome: AuditOutcome,
}

pub trait Audit: Sync {
    fn id(&self) -> &'static str;

    fn audit(&self, artifacts: &ComputedArtifacts<'_>) -> Result<AuditProduct, AuditError>;
}

/// The standard set of opportunity audits.
pub fn default_audits() -> Vec<Box<dyn Audit>> {
    vec![
        Box::new(UnminifiedCss),
        Box::new(UsesRelPreconnect),
        Box::new(UsesRelPreload),
        Box::new(RenderBlockingResources),
    ]
}

/// Run each audit behind its own error boundary. One audit failing never
/// affects the others.
pub fn run_audits(audits: &[Box<dyn Audit>], artifacts: &ComputedArtifacts<'_>) -> Vec<AuditResult> {
    audits
        .iter()
        .map(|audit| {
            let id = audit.id();
            let outcome = match audit.audit(artifacts) {
                Ok(product) => {
                    info!("Audit {id}: score {:.2}, {:.0}ms", product.score, product.numeric_value);
                    AuditOutcome::Scored(product)
                }
                Err(e) => {
                    warn!("Audit {id} failed: {e}");
                    AuditOutcome::Error {
                        message: e.to_string(),
                    }
                }
            };
            AuditResult { id, outcome }
        })
        .collect()
}
