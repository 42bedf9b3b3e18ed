//! Prompts for extraction, synthesis, classification and focus summaries.
//!
//! Centralising every prompt here keeps wording changes out of the stage
//! logic, and lets unit tests assert on the contract each prompt establishes
//! with the parser (tag names, JSON keys, citation format) without a model.

use crate::config::DocumentCategory;
use crate::output::{DocumentType, PageRecord, SynthesisResult};
use std::collections::BTreeMap;

/// User turn appended after a length-truncated reply.
pub const CONTINUE_PROMPT: &str = "Please continue from where you left off.";

/// Textual convention for page citations inside the synthesis.
pub const PAGE_CITATION_FORMAT: &str = "(pg 1)\", \"(pg 1, pg 7)";

/// Instruction for one extraction batch.
///
/// The contract with [`crate::pipeline::parse::parse_page_blocks`]: one
/// `<output page="N">` block per page, containing `<page_type>` and
/// `<page_content>`.
pub fn extraction_prompt(
    category: DocumentCategory,
    document_type: Option<DocumentType>,
    page_numbers: &[usize],
) -> String {
    let classified = document_type
        .map(|t| format!("\nThe document has been classified as: {t}\n"))
        .unwrap_or_default();

    format!(
        r#"You are an underwriter analyzing pages {page_numbers:?} from a pdf containing {subject}.{classified}
Your job is to extract all relevant data from each page related to underwriting, such as:
- Health details (medical history, conditions, medications, lab results)
- Occupation information
- Credit scores
- Driving history
- Hobbies
- Property, location and coverage details
- Discrepancies (contradictory or unclear information)

Guidelines:
- For each page, think about the page in <thinking>...</thinking> tags.
- Then output the page details in <output page="X">...</output> tags.
- Within the <output>, start with a description of the <page_type>, such as "Pharmacy Report" or "Driving History" or "Occupation History".
   - If it's a continuation of a previous page, add "-Continued".
- Then include all information relevant to underwriting in <page_content>...</page_content> tags. Dates are very important.
- Do not mention absent information, as each page will pertain to only specific information.
- Some pages may have redactions. That is ok. Just ignore them.

Output example:
<output page="1">
    <page_type>Pharmacy Report-Continued</page_type>
    <page_content>
        - Date Submitted: 12/29/2020
        - Gender: Male
        - Risk Score: 2.650
        - Medications:
            - Prescription by Oncologist (#380)
            - Anti-Convulsant with multiple uses (#354)
    </page_content>
</output>
Here come the images:"#,
        subject = category.describe(),
    )
}

/// Label placed before each page image in an extraction turn.
pub fn page_image_label(page_num: usize) -> String {
    format!("Page {page_num}:")
}

/// First synthesis turn: establish the target JSON shape and ask for a skeleton.
pub fn synthesis_seed_prompt(refinement_batch_size: usize) -> String {
    let keys = SynthesisResult::REQUIRED_KEYS;
    format!(
        r#"You are a senior underwriter. I will show you page-level summaries in groups of {refinement_batch_size} at a time
from an underwriting document. Your job: combine them into an overall risk assessment. Identify specific risks,
callouts, and discrepancies. Cite the page number(s) where info was found. Keep updating and refining your
assessment each time you receive new page summaries.

You must:
1) Keep a chain-of-thought in <thinking>...</thinking> tags.
2) Produce interim and final results in <output> tags containing VALID JSON like this exact format:
<output>
{{
    "{k0}": "Detailed assessment with page references...",
    "{k1}": "List of any conflicting information found with page references (pay special attention to medication prescriptions, which can indicate undisclosed conditions)",
    "{k2}": "Timeline of major events ordered by date with page references. Only include major events, not minor ones.",
    "{k3}": "Clear recommendation based on all data. Do not make recommendations on accept or decline, but rather observe risks and recommend next steps."
}}
</output>

Important:
- Use EXACTLY the aforementioned key names
- Make sure your JSON is properly formatted with quotes
- Put the entire JSON inside <output> tags
Guidelines:
- Always include the page number(s) in your analysis. Use exactly this format "{PAGE_CITATION_FORMAT}"
- Your general rule of thumb should be to add or refine information to the JSON, but not remove information.
- Note concerns or red flags factually and request clarification if needed; avoid speculative or aggressive language.
- If something is uncertain, mark it as "requires further clarification" or "possible discrepancy."

Begin by acknowledging this prompt in your chain-of-thought, then produce an initial empty JSON structure within <output> tags."#,
        k0 = keys[0],
        k1 = keys[1],
        k2 = keys[2],
        k3 = keys[3],
    )
}

/// Follow-up synthesis turn folding `records` into the current analysis.
pub fn synthesis_refine_prompt(current_analysis: &str, records: &[PageRecord]) -> String {
    let mut text = format!("Analysis so far:\n{current_analysis}\n\nHere are new page summaries:\n");
    for r in records {
        text.push_str(&format!("Page {}: [{}] {}\n", r.page_num, r.page_type, r.content));
    }
    text.push_str(&format!(
        "\nPlease refine your overall analysis. Extend it with the new information; do not erase \
         what is already there. Keep the chain-of-thought in <thinking> tags. Update the JSON inside \
         <output> so it has the keys [{}]. Reference page numbers using the format \"{}\".",
        SynthesisResult::REQUIRED_KEYS.join(", "),
        PAGE_CITATION_FORMAT,
    ));
    text
}

/// Ask the fast model for a one-line "what am I doing" phrase.
pub fn focus_prompt(thinking: &str) -> String {
    format!(
        r#"You are helping summarize an underwriter's current analytical focus.
Below is their current thinking. Respond with ONLY a single, very concise sentence that captures
what they are currently analyzing or considering. Start with an -ing verb.

Example responses:
- "Analyzing medical history..."
- "Comparing medication lists against disclosed conditions..."
- "Cross-referencing lifestyle factors with medical records..."

Guidelines:
- Wrap your response in <output>...</output> tags.
- Keep the response very concise. Brevity is preferred over an accurate summary.
- Do not include any other text in your response.
Current thinking:
{thinking}"#
    )
}

/// System prompt for follow-up questions about a finished job.
///
/// Carries every page record and the synthesis so the model answers from
/// the analysis rather than from the document images.
pub fn chat_system_prompt(
    category: DocumentCategory,
    document_type: Option<DocumentType>,
    pages: &BTreeMap<usize, PageRecord>,
    synthesis: Option<&SynthesisResult>,
) -> String {
    let classified = document_type
        .map(|t| format!("The document has been classified as: {t}\n"))
        .unwrap_or_default();
    let mut page_lines = String::new();
    for r in pages.values() {
        page_lines.push_str(&format!("Page {}: [{}] {}\n", r.page_num, r.page_type, r.content));
    }
    let analysis = synthesis
        .and_then(|s| serde_json::to_string_pretty(s).ok())
        .unwrap_or_else(|| "{}".to_string());

    format!(
        r#"You are an underwriting assistant answering questions about a pdf containing {subject}.
{classified}
Page analysis:
{page_lines}
Underwriter analysis:
{analysis}

Guidelines:
- Answer only from the analysis above. If you are unsure or the information is missing, say so.
- Cite pages as markdown links in the form [pg 12](/page/12).
- Keep answers concise and format them as markdown."#,
        subject = category.describe(),
    )
}

/// Labels classification may answer with for `category`.
pub fn allowed_document_types(category: DocumentCategory) -> &'static [DocumentType] {
    match category {
        DocumentCategory::Life => &[
            DocumentType::LifeInsuranceApplication,
            DocumentType::MedicalReport,
            DocumentType::AttendingPhysicianStatement,
            DocumentType::LabReport,
            DocumentType::PrescriptionHistory,
            DocumentType::FinancialStatement,
            DocumentType::Other,
        ],
        DocumentCategory::PropertyCasualty => &[
            DocumentType::AcordForm,
            DocumentType::MedicalReport,
            DocumentType::FinancialStatement,
            DocumentType::CommercialPropertyApplication,
            DocumentType::CrimeReport,
            DocumentType::Other,
        ],
    }
}

/// First-page classification instruction.
pub fn classification_prompt(category: DocumentCategory) -> String {
    let labels: Vec<&str> = allowed_document_types(category)
        .iter()
        .map(DocumentType::label)
        .collect();
    format!(
        "Analyze the provided image, which is the first page of {subject}.\n\
         Based *only* on this first page, classify the document type.\n\
         The possible types are: {types}.\n\
         If a document doesn't clearly fit the above categories, choose OTHER.\n\n\
         Respond ONLY with a JSON object containing a single key 'document_type' with the classification value.\n\
         Example Output: {{\"document_type\": \"{example}\"}}",
        subject = category.describe(),
        types = labels.join(", "),
        example = labels[0],
    )
}
