//! Greedy farthest-point subset selection over small parameter vectors.
//!
//! Used to pick representative keyframes: poses are mapped to 6-D vectors
//! (exponential rotation + translation), image-point drifts to 2-D offsets,
//! and the subset grows one element at a time, always taking the candidate
//! with the largest distance to the already selected set.

use nalgebra::Isometry3;

#[derive(Debug, Clone)]
pub struct SuccessionSubset {
    objects: Vec<Vec<f64>>,
    selected: Vec<usize>,
    /// Squared distance of each candidate to the nearest selected element.
    min_sqr_distances: Vec<f64>,
}

impl SuccessionSubset {
    pub fn new(objects: Vec<Vec<f64>>) -> Self {
        let len = objects.len();
        Self {
            objects,
            selected: Vec::new(),
            min_sqr_distances: vec![f64::MAX; len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    #[inline]
    pub fn selected(&self) -> &[usize] {
        &self.selected
    }

    /// Adds the next element: the centroid-nearest element first, thereafter
    /// the element farthest from the selected set. Returns the added index.
    pub fn increment(&mut self) -> Option<usize> {
        if self.selected.len() >= self.objects.len() {
            return None;
        }

        let index = if self.selected.is_empty() {
            self.nearest_to_centroid()
        } else {
            self.min_sqr_distances
                .iter()
                .enumerate()
                .filter(|(i, _)| !self.selected.contains(i))
                .max_by(|a, b| a.1.partial_cmp(b.1).expect("non-finite distance"))
                .map(|(i, _)| i)?
        };

        self.push(index);
        Some(index)
    }

    /// Adds an explicitly chosen element, e.g. the pose with the most
    /// correspondences as the seed of a covering selection.
    pub fn increment_with(&mut self, index: usize) -> bool {
        if index >= self.objects.len() || self.selected.contains(&index) {
            return false;
        }
        self.push(index);
        true
    }

    /// Selects up to `count` elements and returns their indices in selection
    /// order.
    pub fn subset(&mut self, count: usize) -> Vec<usize> {
        while self.selected.len() < count && self.increment().is_some() {}
        self.selected.clone()
    }

    fn push(&mut self, index: usize) {
        self.selected.push(index);

        let added = self.objects[index].clone();
        for (candidate, min_sqr) in self.objects.iter().zip(self.min_sqr_distances.iter_mut()) {
            let sqr = sqr_distance(candidate, &added);
            if sqr < *min_sqr {
                *min_sqr = sqr;
            }
        }
    }

    fn nearest_to_centroid(&self) -> usize {
        let dimension = self.objects[0].len();
        let mut centroid = vec![0.0; dimension];
        for object in &self.objects {
            for (c, v) in centroid.iter_mut().zip(object.iter()) {
                *c += v;
            }
        }
        for c in centroid.iter_mut() {
            *c /= self.objects.len() as f64;
        }

        self.objects
            .iter()
            .enumerate()
            .min_by(|a, b| {
                sqr_distance(a.1, &centroid)
                    .partial_cmp(&sqr_distance(b.1, &centroid))
                    .expect("non-finite distance")
            })
            .map(|(i, _)| i)
            .expect("non-empty objects")
    }
}

fn sqr_distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// The 6-D succession vector of a pose: exponential rotation coordinates
/// followed by the translation.
pub fn pose_vector(world_t_camera: &Isometry3<f64>) -> Vec<f64> {
    let rotation = world_t_camera.rotation.scaled_axis();
    let translation = world_t_camera.translation.vector;
    vec![
        rotation.x,
        rotation.y,
        rotation.z,
        translation.x,
        translation.y,
        translation.z,
    ]
}
