//! The ticket analysis pipeline: intake, classification, three parallel
//! analysts, and a final report.

use std::sync::Arc;

use triage_core::provider::ModelProvider;
use triage_core::state::Slot;
use triage_index::SimilarityIndex;

use crate::composer::{ParallelComposer, SequentialComposer, Step};
use crate::error::EngineError;
use crate::hooks::SummarizationPolicy;
use crate::stage::{Stage, StageBuilder};
use crate::tools::search_similar_tickets::{self, DEFAULT_SEARCH_TOP_K};
use crate::tools::{AnalyzeScreenshotTool, SearchSimilarTicketsTool};

pub const PIPELINE_NAME: &str = "ticket_analysis";
pub const DEEP_ANALYSIS: &str = "deep_analysis";

pub const SEARCH_APPROVAL_DESCRIPTION: &str =
    "Review whether to search similar tickets. High-priority tickets need a human to confirm.";

const RECEIVER_INSTRUCTION: &str = "\
You are the ticket intake assistant. Your job:
1. Parse the ticket the user submitted.
2. Extract the key facts: the user's request, the problem, the device.
3. Describe any screenshots, using analyze_screenshot when one is attached.
4. Produce a structured summary for the next stage.";

const CLASSIFIER_INSTRUCTION: &str = "\
You are the ticket classification expert. Your job:
1. Decide the ticket category: BUG_REPORT, FEATURE_REQUEST, PERFORMANCE_ISSUE, \
UI_UX_ISSUE, ACCOUNT_ISSUE, or OTHER.
2. Use search_similar_tickets to look up historical tickets like this one.
3. Decide whether it duplicates a known problem.
4. List the key problem points.
Start your answer with the category.";

const ROOT_CAUSE_INSTRUCTION: &str = "\
You are the root cause analyst. Focus on:
1. The underlying cause of the problem.
2. The technical layer where it lives.
3. How far its effects reach.";

const IMPACT_INSTRUCTION: &str = "\
You are the impact assessor. Focus on:
1. How badly users are affected.
2. How the business is affected.
3. The priority this problem deserves.";

const SOLUTION_INSTRUCTION: &str = "\
You are the solution provider. Focus on:
1. A technical fix.
2. Short-term mitigations.
3. Longer-term improvements.";

const REPORT_INSTRUCTION: &str = "\
You are the report writer. From the analyses so far, write:
1. A ticket summary.
2. Its category and tags.
3. References to similar historical tickets.
4. The problem analysis.
5. Recommended handling.
6. A priority assessment.";

/// Knobs for [`ticket_analysis`].
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Require human approval before the classifier searches past tickets.
    pub approve_similarity_search: bool,
    pub search_top_k: usize,
    /// Per-stage tool-call ceiling; the engine default applies when unset.
    pub tool_call_ceiling: Option<u32>,
    pub summarization: SummarizationPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            approve_similarity_search: false,
            search_top_k: DEFAULT_SEARCH_TOP_K,
            tool_call_ceiling: None,
            summarization: SummarizationPolicy::default(),
        }
    }
}

/// Assemble the ticket analysis pipeline.
pub fn ticket_analysis(
    provider: Arc<dyn ModelProvider>,
    index: Arc<SimilarityIndex>,
    options: &PipelineOptions,
) -> Result<SequentialComposer, EngineError> {
    let common = |builder: StageBuilder| {
        let builder = builder.summarization(options.summarization.clone());
        match options.tool_call_ceiling {
            Some(ceiling) => builder.tool_call_ceiling(ceiling),
            None => builder,
        }
    };

    let receiver = common(
        Stage::builder("ticket_receiver", Slot::StructuredTicket)
            .instruction(RECEIVER_INSTRUCTION)
            .reads([Slot::Input])
            .tool(Arc::new(AnalyzeScreenshotTool::new(provider))),
    )
    .build()?;

    let mut classifier = Stage::builder("ticket_classifier", Slot::ClassificationResult)
        .instruction(CLASSIFIER_INSTRUCTION)
        .reads([Slot::StructuredTicket])
        .tool(Arc::new(
            SearchSimilarTicketsTool::new(index).with_top_k(options.search_top_k),
        ))
        .capture(search_similar_tickets::TOOL_NAME, Slot::SimilarTickets);
    if options.approve_similarity_search {
        classifier =
            classifier.approval_gate(search_similar_tickets::TOOL_NAME, SEARCH_APPROVAL_DESCRIPTION);
    }
    let classifier = common(classifier).build()?;

    let analyst = |name: &str, instruction: &str, output: Slot| {
        common(
            Stage::builder(name, output)
                .instruction(instruction)
                .reads([Slot::StructuredTicket, Slot::ClassificationResult, Slot::SimilarTickets]),
        )
        .build()
        .map(Arc::new)
    };
    let deep_analysis = ParallelComposer::new(
        DEEP_ANALYSIS,
        vec![
            analyst("root_cause_analyst", ROOT_CAUSE_INSTRUCTION, Slot::RootCauseAnalysis)?,
            analyst("impact_assessor", IMPACT_INSTRUCTION, Slot::ImpactAssessment)?,
            analyst("solution_provider", SOLUTION_INSTRUCTION, Slot::SolutionProposal)?,
        ],
    )?;

    let generator = common(
        Stage::builder("result_generator", Slot::FinalReport)
            .instruction(REPORT_INSTRUCTION)
            .reads([
                Slot::StructuredTicket,
                Slot::ClassificationResult,
                Slot::SimilarTickets,
                Slot::RootCauseAnalysis,
                Slot::ImpactAssessment,
                Slot::SolutionProposal,
            ]),
    )
    .build()?;

    SequentialComposer::new(
        PIPELINE_NAME,
        vec![
            Step::Stage(Arc::new(receiver)),
            Step::Stage(Arc::new(classifier)),
            Step::Parallel(deep_analysis),
            Step::Stage(Arc::new(generator)),
        ],
    )
}
