use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::corpus::{EvidenceCorpus, SentenceEvidence};
use crate::TrainingError;

/// Closed set of per-epoch unit sampling policies. Resolved from its
/// configured name once at startup; unrecognized names fail there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingPolicy {
    /// Concatenate all sentences of a document into a single unit.
    WholeDocument,
}

impl SamplingPolicy {
    pub fn resolve(name: &str) -> Result<Self, TrainingError> {
        match name {
            "whole_document" => Ok(SamplingPolicy::WholeDocument),
            other => Err(TrainingError::initialization(format!(
                "unrecognized sampling method '{}'",
                other
            ))),
        }
    }

    fn sample_unit(&self, sentences: &[SentenceEvidence]) -> SentenceEvidence {
        match self {
            SamplingPolicy::WholeDocument => chain_sentences(sentences),
        }
    }
}

/// One sampled training/evaluation instance: a unit plus its document label.
#[derive(Debug, Clone)]
pub struct EpochInstance {
    pub label: String,
    pub evidence: SentenceEvidence,
}

/// Draws one unit per (annotation, document) pair for an epoch, with the
/// annotation ordering shuffled. Every pair contributes exactly once; only
/// the ordering changes from epoch to epoch (vary `seed` per epoch).
pub fn sample_epoch(corpus: &EvidenceCorpus, policy: SamplingPolicy, seed: u64) -> Vec<EpochInstance> {
    let mut entries: Vec<_> = corpus.iter().map(|(_, entry)| entry).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    entries.shuffle(&mut rng);

    let mut instances = Vec::with_capacity(corpus.unit_count());
    for entry in entries {
        for sentences in entry.documents.values() {
            instances.push(EpochInstance {
                label: entry.label.clone(),
                evidence: policy.sample_unit(sentences),
            });
        }
    }
    instances
}

fn chain_sentences(sentences: &[SentenceEvidence]) -> SentenceEvidence {
    let first = &sentences[0];
    let mut token_ids = Vec::with_capacity(sentences.iter().map(|s| s.token_ids.len()).sum());
    let mut targets = Vec::with_capacity(token_ids.capacity());
    let mut has_evidence = false;
    for sentence in sentences {
        token_ids.extend_from_slice(&sentence.token_ids);
        targets.extend_from_slice(&sentence.targets);
        has_evidence |= sentence.has_evidence;
    }
    SentenceEvidence {
        annotation_id: first.annotation_id.clone(),
        doc_id: first.doc_id.clone(),
        index: 0,
        token_ids,
        query: first.query.clone(),
        targets,
        has_evidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Annotation, EvidenceSpan};
    use std::collections::{HashMap, HashSet};

    fn corpus(num_annotations: usize) -> EvidenceCorpus {
        let mut documents = HashMap::new();
        let mut annotations = Vec::new();
        for i in 0..num_annotations {
            let doc_id = format!("d{}", i);
            documents.insert(doc_id.clone(), vec![vec![1, 2, 3], vec![4, 5]]);
            annotations.push(Annotation {
                id: format!("a{}", i),
                doc_ids: vec![doc_id.clone()],
                query: None,
                label: "pos".to_string(),
                evidence: vec![EvidenceSpan {
                    doc_id,
                    start: 0,
                    end: 2,
                }],
            });
        }
        EvidenceCorpus::build(&annotations, &documents).unwrap()
    }

    #[test]
    fn unknown_policy_name_fails_fast() {
        assert!(SamplingPolicy::resolve("whole_document").is_ok());
        assert!(SamplingPolicy::resolve("bag_of_sentences").is_err());
    }

    #[test]
    fn every_pair_is_covered_exactly_once() {
        let corpus = corpus(7);
        for seed in [0, 1, 99] {
            let epoch = sample_epoch(&corpus, SamplingPolicy::WholeDocument, seed);
            assert_eq!(epoch.len(), corpus.unit_count());
            let pairs: HashSet<(String, String)> = epoch
                .iter()
                .map(|i| (i.evidence.annotation_id.clone(), i.evidence.doc_id.clone()))
                .collect();
            assert_eq!(pairs.len(), epoch.len());
        }
    }

    #[test]
    fn ordering_is_seed_dependent_but_reproducible() {
        let corpus = corpus(20);
        let order = |seed| -> Vec<String> {
            sample_epoch(&corpus, SamplingPolicy::WholeDocument, seed)
                .into_iter()
                .map(|i| i.evidence.annotation_id)
                .collect()
        };
        assert_eq!(order(3), order(3));
        assert_ne!(order(3), order(4));
    }

    #[test]
    fn whole_document_concatenates_sentences() {
        let corpus = corpus(1);
        let epoch = sample_epoch(&corpus, SamplingPolicy::WholeDocument, 0);
        assert_eq!(epoch.len(), 1);
        let unit = &epoch[0].evidence;
        assert_eq!(unit.token_ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(unit.targets, vec![1.0, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(unit.index, 0);
        assert!(unit.has_evidence);
    }
}
