//! Per-PDF document-type classification.
//!
//! The LLM is a best-effort oracle: any failure, quota exhaustion, malformed
//! response or low-confidence verdict drops to the filename heuristic, which
//! always produces a valid label on its own.

pub mod llm;

use serde::{Deserialize, Serialize};

use llm::{LlmClient, LlmError};

/// Minimum LLM confidence accepted before falling back to the heuristic.
const MIN_CONFIDENCE: f64 = 0.5;
/// How much first-page text is handed to the model.
const EXCERPT_MAX_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    ProductDataSheet,
    SpecificationSheet,
    SubmittalSheet,
    TechnicalDataSheet,
    InstallationManual,
    OperationMaintenance,
    EngineeringDiagram,
    Marketing,
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::ProductDataSheet => "Product Data Sheet",
            DocumentType::SpecificationSheet => "Specification Sheet",
            DocumentType::SubmittalSheet => "Submittal Sheet",
            DocumentType::TechnicalDataSheet => "Technical Data Sheet",
            DocumentType::InstallationManual => "Installation Manual",
            DocumentType::OperationMaintenance => "Operation & Maintenance",
            DocumentType::EngineeringDiagram => "Engineering Diagram",
            DocumentType::Marketing => "Marketing",
            DocumentType::Unknown => "Unknown",
        }
    }

    /// Parse a label as returned by the model (case-insensitive).
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_lowercase();
        let all = [
            DocumentType::ProductDataSheet,
            DocumentType::SpecificationSheet,
            DocumentType::SubmittalSheet,
            DocumentType::TechnicalDataSheet,
            DocumentType::InstallationManual,
            DocumentType::OperationMaintenance,
            DocumentType::EngineeringDiagram,
            DocumentType::Marketing,
            DocumentType::Unknown,
        ];
        all.into_iter().find(|t| t.as_str().to_lowercase() == label)
    }

    /// Whether this type is in the upload allow-list. Installation manuals
    /// are explicitly excluded.
    pub fn is_technical(&self) -> bool {
        matches!(
            self,
            DocumentType::ProductDataSheet
                | DocumentType::SpecificationSheet
                | DocumentType::SubmittalSheet
                | DocumentType::TechnicalDataSheet
        )
    }
}

/// Filename-substring rule table, checked in order. Independent of the LLM
/// so classification keeps working when the model is down.
const FILENAME_RULES: &[(&str, DocumentType)] = &[
    ("install", DocumentType::InstallationManual),
    ("iom", DocumentType::OperationMaintenance),
    ("submittal", DocumentType::SubmittalSheet),
    ("spec", DocumentType::SpecificationSheet),
    ("datasheet", DocumentType::ProductDataSheet),
    ("data-sheet", DocumentType::ProductDataSheet),
    ("data_sheet", DocumentType::ProductDataSheet),
    ("catalog", DocumentType::Marketing),
    ("brochure", DocumentType::Marketing),
];

/// Classify by filename alone.
pub fn classify_filename(filename: &str) -> DocumentType {
    let name = filename.to_lowercase();
    for (needle, doc_type) in FILENAME_RULES {
        if name.contains(needle) {
            return *doc_type;
        }
    }
    DocumentType::Unknown
}

/// A finished classification decision.
#[derive(Debug, Clone)]
pub struct Classification {
    pub document_type: DocumentType,
    pub is_technical: bool,
    pub via_llm: bool,
}

pub struct Classifier {
    llm: Option<LlmClient>,
}

impl Classifier {
    pub fn new(llm: Option<LlmClient>) -> Self {
        Classifier { llm }
    }

    /// Decide the document type for one PDF. `pdf_bytes` is optional: when
    /// the download failed the decision is made on the filename alone.
    pub async fn classify(&self, filename: &str, pdf_bytes: Option<&[u8]>) -> Classification {
        let excerpt = pdf_bytes.and_then(first_page_text);

        if let Some(llm) = &self.llm {
            match llm.classify(filename, excerpt.as_deref()).await {
                Ok(verdict) if verdict.confidence >= MIN_CONFIDENCE => {
                    if let Some(doc_type) = DocumentType::from_label(&verdict.document_type) {
                        return Classification {
                            document_type: doc_type,
                            is_technical: doc_type.is_technical(),
                            via_llm: true,
                        };
                    }
                    tracing::warn!(
                        filename = %filename,
                        label = %verdict.document_type,
                        "Model returned unknown label, falling back to filename"
                    );
                }
                Ok(verdict) => {
                    tracing::debug!(
                        filename = %filename,
                        confidence = verdict.confidence,
                        "Low-confidence verdict, falling back to filename"
                    );
                }
                Err(LlmError::Quota) => {
                    tracing::warn!(filename = %filename, "Model quota exhausted, using filename heuristic");
                }
                Err(e) => {
                    tracing::warn!(filename = %filename, error = %e, "Model call failed, using filename heuristic");
                }
            }
        }

        let doc_type = classify_filename(filename);
        Classification {
            document_type: doc_type,
            is_technical: doc_type.is_technical(),
            via_llm: false,
        }
    }
}

/// Best-effort extraction of the first page's text.
pub fn first_page_text(bytes: &[u8]) -> Option<String> {
    let doc = lopdf::Document::load_mem(bytes).ok()?;
    let text = doc.extract_text(&[1]).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(EXCERPT_MAX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list() {
        assert!(DocumentType::ProductDataSheet.is_technical());
        assert!(DocumentType::SpecificationSheet.is_technical());
        assert!(DocumentType::SubmittalSheet.is_technical());
        assert!(DocumentType::TechnicalDataSheet.is_technical());
        // Installation manuals are excluded even though they are technical
        // documents in the colloquial sense.
        assert!(!DocumentType::InstallationManual.is_technical());
        assert!(!DocumentType::OperationMaintenance.is_technical());
        assert!(!DocumentType::Marketing.is_technical());
        assert!(!DocumentType::Unknown.is_technical());
    }

    #[test]
    fn test_filename_rules() {
        assert_eq!(
            classify_filename("pump-101-installation-guide.pdf"),
            DocumentType::InstallationManual
        );
        assert_eq!(
            classify_filename("AHU_IOM_rev3.pdf"),
            DocumentType::OperationMaintenance
        );
        assert_eq!(
            classify_filename("valve-submittal.pdf"),
            DocumentType::SubmittalSheet
        );
        assert_eq!(
            classify_filename("Model-X-Spec.pdf"),
            DocumentType::SpecificationSheet
        );
        assert_eq!(
            classify_filename("chiller_datasheet.pdf"),
            DocumentType::ProductDataSheet
        );
        assert_eq!(classify_filename("2024-catalog.pdf"), DocumentType::Marketing);
        assert_eq!(classify_filename("brochure-en.pdf"), DocumentType::Marketing);
        assert_eq!(classify_filename("whitepaper.pdf"), DocumentType::Unknown);
    }

    #[test]
    fn test_install_beats_spec() {
        // "installation_spec.pdf" matches both rules; install is checked
        // first so the artifact stays out of the upload set.
        assert_eq!(
            classify_filename("installation_spec.pdf"),
            DocumentType::InstallationManual
        );
    }

    #[test]
    fn test_from_label_case_insensitive() {
        assert_eq!(
            DocumentType::from_label("product data sheet"),
            Some(DocumentType::ProductDataSheet)
        );
        assert_eq!(
            DocumentType::from_label("  Submittal Sheet "),
            Some(DocumentType::SubmittalSheet)
        );
        assert_eq!(
            DocumentType::from_label("Operation & Maintenance"),
            Some(DocumentType::OperationMaintenance)
        );
        assert_eq!(DocumentType::from_label("Novel"), None);
    }

    #[tokio::test]
    async fn test_classify_without_llm_uses_heuristic() {
        let classifier = Classifier::new(None);
        let c = classifier.classify("fan-datasheet.pdf", None).await;
        assert_eq!(c.document_type, DocumentType::ProductDataSheet);
        assert!(c.is_technical);
        assert!(!c.via_llm);
    }

    #[test]
    fn test_first_page_text_rejects_garbage() {
        assert!(first_page_text(b"not a pdf at all").is_none());
        assert!(first_page_text(b"").is_none());
    }
}
