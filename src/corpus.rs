use std::collections::{BTreeMap, HashMap};

use crate::TrainingError;

/// Per-document alignment from original tokens to sub-token spans: entry `t`
/// is the half-open `(start, end)` range of sub-token positions covering the
/// document's `t`-th original token.
pub type TokenAlignmentMap = HashMap<String, Vec<(usize, usize)>>;

/// A human-marked rationale span over a document's sub-token sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceSpan {
    pub doc_id: String,
    pub start: usize,
    pub end: usize,
}

/// One labeled example as loaded from disk, already sub-tokenized. Immutable
/// once constructed.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub id: String,
    pub doc_ids: Vec<String>,
    /// Sub-token ids of the query, `None` for non-query tasks.
    pub query: Option<Vec<u32>>,
    pub label: String,
    pub evidence: Vec<EvidenceSpan>,
}

/// One unit a sampler can select: a sentence (or concatenation of sentences)
/// of a document, with its binary per-sub-token rationale targets.
#[derive(Debug, Clone)]
pub struct SentenceEvidence {
    pub annotation_id: String,
    pub doc_id: String,
    /// Index of the unit within its document.
    pub index: usize,
    pub token_ids: Vec<u32>,
    pub query: Option<Vec<u32>>,
    /// 1.0 where the sub-token is part of a rationale, 0.0 elsewhere.
    pub targets: Vec<f32>,
    /// False when the annotation marks no rationale inside this unit; such
    /// units are excluded from the rationale loss.
    pub has_evidence: bool,
}

impl SentenceEvidence {
    pub fn query_len(&self) -> usize {
        self.query.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone)]
pub struct AnnotationEvidence {
    pub label: String,
    pub documents: BTreeMap<String, Vec<SentenceEvidence>>,
}

/// Evidence units for one split, keyed by annotation id then document id.
/// Built once per split; only the per-epoch sampling over it varies.
#[derive(Debug, Clone, Default)]
pub struct EvidenceCorpus {
    entries: BTreeMap<String, AnnotationEvidence>,
}

impl EvidenceCorpus {
    /// Derives sentence-level evidence units for every annotation.
    ///
    /// `documents` maps document id to its sentences, each a sub-token id
    /// sequence; evidence spans index into the document's flattened sub-token
    /// sequence.
    pub fn build(
        annotations: &[Annotation],
        documents: &HashMap<String, Vec<Vec<u32>>>,
    ) -> Result<Self, TrainingError> {
        let mut entries = BTreeMap::new();
        for annotation in annotations {
            let mut by_doc = BTreeMap::new();
            for doc_id in &annotation.doc_ids {
                let sentences = documents.get(doc_id).ok_or_else(|| {
                    TrainingError::initialization(format!(
                        "annotation {} references unknown document {}",
                        annotation.id, doc_id
                    ))
                })?;
                if sentences.is_empty() {
                    return Err(TrainingError::initialization(format!(
                        "document {} contains no sentences",
                        doc_id
                    )));
                }
                let units = document_units(annotation, doc_id, sentences)?;
                by_doc.insert(doc_id.clone(), units);
            }
            entries.insert(
                annotation.id.clone(),
                AnnotationEvidence {
                    label: annotation.label.clone(),
                    documents: by_doc,
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AnnotationEvidence)> {
        self.entries.iter()
    }

    pub fn get(&self, annotation_id: &str) -> Option<&AnnotationEvidence> {
        self.entries.get(annotation_id)
    }

    /// Number of annotations in the split.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of (annotation, document) pairs, i.e. units one epoch samples.
    pub fn unit_count(&self) -> usize {
        self.entries
            .values()
            .map(|entry| entry.documents.len())
            .sum()
    }
}

fn document_units(
    annotation: &Annotation,
    doc_id: &str,
    sentences: &[Vec<u32>],
) -> Result<Vec<SentenceEvidence>, TrainingError> {
    let total_tokens: usize = sentences.iter().map(Vec::len).sum();
    let mut flat_targets = vec![0.0f32; total_tokens];
    for span in annotation.evidence.iter().filter(|s| s.doc_id == doc_id) {
        if span.start > span.end || span.end > total_tokens {
            return Err(TrainingError::initialization(format!(
                "annotation {} evidence span {}..{} is out of range for document {} ({} tokens)",
                annotation.id, span.start, span.end, doc_id, total_tokens
            )));
        }
        for slot in &mut flat_targets[span.start..span.end] {
            *slot = 1.0;
        }
    }

    let mut units = Vec::with_capacity(sentences.len());
    let mut offset = 0;
    for (index, sentence) in sentences.iter().enumerate() {
        let targets = flat_targets[offset..offset + sentence.len()].to_vec();
        let has_evidence = targets.iter().any(|&t| t > 0.0);
        units.push(SentenceEvidence {
            annotation_id: annotation.id.clone(),
            doc_id: doc_id.to_string(),
            index,
            token_ids: sentence.clone(),
            query: annotation.query.clone(),
            targets,
            has_evidence,
        });
        offset += sentence.len();
    }
    Ok(units)
}

/// Interned class-name vocabulary; ids follow the order the names were given.
#[derive(Debug, Clone)]
pub struct LabelVocab {
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl LabelVocab {
    pub fn new<S: AsRef<str>>(classes: &[S]) -> Self {
        let names: Vec<String> = classes.iter().map(|c| c.as_ref().to_string()).collect();
        let ids = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();
        Self { names, ids }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn id_of(&self, name: &str) -> Result<usize, TrainingError> {
        self.ids.get(name).copied().ok_or_else(|| {
            TrainingError::initialization(format!("unknown class label '{}'", name))
        })
    }

    pub fn one_hot(&self, name: &str) -> Result<Vec<f32>, TrainingError> {
        let id = self.id_of(name)?;
        let mut row = vec![0.0f32; self.names.len()];
        row[id] = 1.0;
        Ok(row)
    }
}
