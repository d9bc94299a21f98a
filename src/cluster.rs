// cluster.rs - Theme clustering
//
// Embeds each theme with the embedding model and groups the vectors with
// DBSCAN over cosine distance. Noise points are dropped; callers treat themes
// missing from every cluster as singletons.

use crate::error::{DigestError, DigestResult};
use crate::lm::Embedder;
use crate::observe::Observer;
use crate::retry::Executor;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Indices into the theme list that clustered together, ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cluster(pub Vec<usize>);

impl Cluster {
    pub fn members(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    /// Maximum cosine distance between two neighbours.
    pub eps: f32,
    /// Neighbourhood size (the point itself included) that makes a core point.
    pub min_samples: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps: 0.1,
            min_samples: 2,
        }
    }
}

pub struct ThemeClusterer {
    embedder: Arc<dyn Embedder>,
    executor: Executor,
    params: ClusterParams,
    observer: Observer,
}

impl ThemeClusterer {
    pub fn new(embedder: Arc<dyn Embedder>, executor: Executor, params: ClusterParams, observer: &Observer) -> Self {
        Self {
            embedder,
            executor,
            params,
            observer: observer.scoped("cluster"),
        }
    }

    /// Embeds every theme (one call each) and clusters the vectors.
    /// Any embedding failure that survives the retry plan fails the whole call.
    pub async fn cluster(&self, themes: &[String]) -> DigestResult<Vec<Cluster>> {
        let target = self.observer.target();
        if themes.is_empty() {
            return Ok(Vec::new());
        }

        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(themes.len());
        for (index, theme) in themes.iter().enumerate() {
            let label = format!("embedding for theme '{}'", theme);
            let embedding = self
                .executor
                .invoke(&label, || self.embedder.embed(theme))
                .await?;

            if let Some(first) = embeddings.first() {
                if first.len() != embedding.len() {
                    return Err(DigestError::EmbeddingDimension {
                        index,
                        expected: first.len(),
                        actual: embedding.len(),
                    });
                }
            }
            embeddings.push(embedding);
        }
        debug!(target: target, "🧮 Embedded {} themes", embeddings.len());

        let clusters = dbscan(&embeddings, self.params.eps, self.params.min_samples);
        info!(
            target: target,
            "🧩 Grouped {} themes into {} cluster(s) (eps={}, min_samples={})",
            themes.len(),
            clusters.len(),
            self.params.eps,
            self.params.min_samples
        );
        Ok(clusters)
    }
}

/// 1 - cosine similarity, clamped to [0, 2]. Zero vectors are maximally
/// dissimilar to everything except nothing.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    (1.0 - similarity).clamp(0.0, 2.0) as f32
}

/// DBSCAN over cosine distance. Points are visited in index order and each
/// cluster is expanded breadth-first from its first core point, so the
/// partition depends only on the vectors, `eps` and `min_samples`.
/// Clusters come back ordered by their smallest member.
pub fn dbscan(points: &[Vec<f32>], eps: f32, min_samples: usize) -> Vec<Cluster> {
    let n = points.len();
    let neighbours: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| i == j || cosine_distance(&points[i], &points[j]) <= eps)
                .collect()
        })
        .collect();
    let is_core: Vec<bool> = neighbours.iter().map(|hood| hood.len() >= min_samples).collect();

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut next_label = 0;

    for start in 0..n {
        if labels[start].is_some() || !is_core[start] {
            continue;
        }
        labels[start] = Some(next_label);
        let mut queue: VecDeque<usize> = neighbours[start].iter().copied().collect();
        while let Some(point) = queue.pop_front() {
            if labels[point].is_some() {
                continue;
            }
            labels[point] = Some(next_label);
            if is_core[point] {
                queue.extend(neighbours[point].iter().copied().filter(|&q| labels[q].is_none()));
            }
        }
        next_label += 1;
    }

    let mut clusters: Vec<Cluster> = (0..next_label).map(|_| Cluster(Vec::new())).collect();
    for (index, label) in labels.iter().enumerate() {
        if let Some(label) = label {
            clusters[*label].0.push(index);
        }
    }
    // A border point claimed by an earlier cluster can leave a later one short.
    clusters.retain(|cluster| cluster.len() >= min_samples.max(1));
    clusters
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::retry::tests::instant_executor;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps known themes to fixed vectors; anything else gets a vector
    /// derived from its letters.
    pub(crate) struct FakeEmbedder {
        pub(crate) vectors: HashMap<String, Vec<f32>>,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeEmbedder {
        pub(crate) fn new(vectors: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: vectors.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> DigestResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(vector) = self.vectors.get(text) {
                return Ok(vector.clone());
            }
            let mut vector = vec![0.0f32; 26];
            for c in text.to_ascii_lowercase().chars().filter(|c| c.is_ascii_lowercase()) {
                vector[(c as u8 - b'a') as usize] += 1.0;
            }
            Ok(vector)
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> DigestResult<Vec<f32>> {
            Err(DigestError::Api { status: 503, body: "embedding model not loaded".to_string() })
        }
    }

    fn clusterer(embedder: Arc<dyn Embedder>, eps: f32, min_samples: usize) -> ThemeClusterer {
        ThemeClusterer::new(
            embedder,
            instant_executor(),
            ClusterParams { eps, min_samples },
            &Observer::default(),
        )
    }

    fn themes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let embedder = Arc::new(FakeEmbedder::new(&[]));
        let clusters = clusterer(embedder.clone(), 0.1, 2).cluster(&[]).await.unwrap();
        assert!(clusters.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_identical_themes_form_one_cluster() {
        let embedder = Arc::new(FakeEmbedder::new(&[]));
        let input = themes(&["Weekend hiking", "Weekend hiking", "Weekend hiking", "Weekend hiking"]);
        let clusters = clusterer(embedder.clone(), 0.1, 3).cluster(&input).await.unwrap();
        assert_eq!(clusters, vec![Cluster(vec![0, 1, 2, 3])]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_noise_is_omitted() {
        let embedder = Arc::new(FakeEmbedder::new(&[
            ("Hiking trip", vec![1.0, 0.0, 0.0]),
            ("Hiking trips", vec![0.99, 0.05, 0.0]),
            ("Rent payment", vec![0.0, 0.0, 1.0]),
        ]));
        let input = themes(&["Rent payment", "Hiking trip", "Hiking trips"]);
        let clusters = clusterer(embedder, 0.1, 2).cluster(&input).await.unwrap();
        assert_eq!(clusters, vec![Cluster(vec![1, 2])]);
    }

    #[tokio::test]
    async fn test_embedding_failure_propagates() {
        let err = clusterer(Arc::new(BrokenEmbedder), 0.1, 2)
            .cluster(&themes(&["Budget"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DigestError::RetriesExhausted { .. }));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_an_error() {
        let embedder = Arc::new(FakeEmbedder::new(&[("a", vec![1.0, 0.0]), ("b", vec![1.0, 0.0, 0.0])]));
        let err = clusterer(embedder, 0.1, 2).cluster(&themes(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, DigestError::EmbeddingDimension { index: 1, expected: 2, actual: 3 }));
    }

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_dbscan_is_deterministic_for_fixed_vectors() {
        let points = vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.98, 0.05],
            vec![0.02, 1.0],
            vec![-1.0, 0.0],
        ];
        let first = dbscan(&points, 0.05, 2);
        let second = dbscan(&points, 0.05, 2);
        assert_eq!(first, second);
        assert_eq!(first, vec![Cluster(vec![0, 2]), Cluster(vec![1, 3])]);
    }

    #[test]
    fn test_dbscan_chains_through_core_points() {
        // 0-1 and 1-2 are within eps, 0-2 is not; 1 is core, so all join.
        let points = vec![
            vec![1.0, 0.0],
            vec![0.9659, 0.2588],
            vec![0.8660, 0.5],
        ];
        let clusters = dbscan(&points, 0.04, 3);
        assert_eq!(clusters, vec![Cluster(vec![0, 1, 2])]);
    }

    #[test]
    fn test_every_cluster_meets_min_samples() {
        let points: Vec<Vec<f32>> = (0..12)
            .map(|i| {
                let angle = i as f32 * 0.2;
                vec![angle.cos(), angle.sin()]
            })
            .collect();
        for min_samples in 1..5 {
            for cluster in dbscan(&points, 0.03, min_samples) {
                assert!(cluster.len() >= min_samples);
            }
        }
    }
}
