//! K-means clustering over chunk embeddings.
//!
//! The cluster labels and centroids together drive theme discovery: labels
//! partition the chunks, centroids pick the representative passages shown
//! to the LLM for naming.

use anyhow::{anyhow, Result};
use linfa::prelude::*;
use linfa_clustering::KMeans;
use ndarray::{Array1, Array2};

#[derive(Debug, Clone)]
pub struct ClusterResult {
    /// One label per input embedding, in input order.
    pub cluster_labels: Array1<usize>,
    pub centroids: Array2<f32>,
}

impl ClusterResult {
    pub fn n_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    /// Member indices per cluster, preserving input order inside each group.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.n_clusters()];
        for (index, label) in self.cluster_labels.iter().enumerate() {
            members[*label].push(index);
        }
        members
    }
}

/// Partition `embeddings` into at most `k` groups. `k` is clamped to the
/// sample count, so asking for more themes than chunks is not an error.
pub fn cluster_embeddings(embeddings: &[Vec<f32>], k: usize) -> Result<ClusterResult> {
    if embeddings.is_empty() {
        return Err(anyhow!("cannot cluster an empty embedding set"));
    }
    let dim = embeddings[0].len();
    if embeddings.iter().any(|e| e.len() != dim) {
        return Err(anyhow!("embeddings have inconsistent dimensions"));
    }
    let k = k.clamp(1, embeddings.len());

    let data = Array2::from_shape_vec((embeddings.len(), dim), embeddings.concat())
        .map_err(|e| anyhow!("failed to shape embedding matrix: {e}"))?;
    let dataset = DatasetBase::from(data);
    let kmeans = KMeans::params(k)
        .max_n_iterations(100)
        .tolerance(1e-5)
        .fit(&dataset)
        .map_err(|e| anyhow!("kmeans fit failed: {e}"))?;

    let cluster_labels = kmeans.predict(&dataset);
    let centroids = kmeans.centroids().clone();

    Ok(ClusterResult {
        cluster_labels,
        centroids,
    })
}

pub fn cosine_to_centroid(embedding: &[f32], centroid: &[f32]) -> f32 {
    let dot: f32 = embedding.iter().zip(centroid).map(|(x, y)| x * y).sum();
    let na: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (na * nb + 1e-6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_well_separated_clusters() {
        let embeddings = vec![
            vec![0.0, 1.0],
            vec![0.1, 0.9],
            vec![40.0, 41.0],
            vec![41.0, 40.0],
        ];
        let result = cluster_embeddings(&embeddings, 2).unwrap();
        assert_eq!(result.cluster_labels.len(), 4);
        assert_eq!(result.n_clusters(), 2);
        // the two near points share a label, the two far points the other
        assert_eq!(result.cluster_labels[0], result.cluster_labels[1]);
        assert_eq!(result.cluster_labels[2], result.cluster_labels[3]);
        assert_ne!(result.cluster_labels[0], result.cluster_labels[2]);
    }

    #[test]
    fn test_every_sample_is_assigned() {
        let embeddings: Vec<Vec<f32>> = (0..7).map(|i| vec![i as f32, 0.5]).collect();
        let result = cluster_embeddings(&embeddings, 3).unwrap();
        let members = result.members();
        let total: usize = members.iter().map(Vec::len).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_k_clamped_to_sample_count() {
        let embeddings = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let result = cluster_embeddings(&embeddings, 10).unwrap();
        assert!(result.n_clusters() <= 2);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(cluster_embeddings(&[], 3).is_err());
    }
}
