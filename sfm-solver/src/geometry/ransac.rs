//! RANSAC wrappers around the minimal geometric solvers.

use nalgebra::{Isometry3, Point3, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3};
use rand::Rng;

use sfm_camera::Camera;

use super::epipolar::sample_indices;
use super::p3p::p3p;
use super::triangulate::triangulate_midpoint;

/// Pose RANSAC over three-point hypotheses.
///
/// Requires at least `minimal_correspondences` (>= 4) correspondences;
/// the consensus is scored by the squared reprojection error.
pub fn p3p_ransac<R: Rng + ?Sized>(
    camera: &Camera,
    object_points: &[Point3<f64>],
    image_points: &[Vector2<f64>],
    rng: &mut R,
    minimal_correspondences: usize,
    iterations: usize,
    max_sqr_error: f64,
) -> Option<(Isometry3<f64>, Vec<usize>)> {
    debug_assert_eq!(object_points.len(), image_points.len());

    let count = object_points.len();
    if count < minimal_correspondences.max(4) {
        return None;
    }

    let mut best: Option<(Isometry3<f64>, Vec<usize>)> = None;

    for _ in 0..iterations {
        let sample = sample_indices(rng, count, 3);

        let candidates = p3p(
            camera,
            &[
                object_points[sample[0]],
                object_points[sample[1]],
                object_points[sample[2]],
            ],
            &[
                image_points[sample[0]],
                image_points[sample[1]],
                image_points[sample[2]],
            ],
        );

        for pose in candidates {
            let inliers: Vec<usize> = (0..count)
                .filter(|&n| {
                    let error = (camera.project(&pose, &object_points[n]) - image_points[n])
                        .norm_squared();
                    error.is_finite() && error <= max_sqr_error
                })
                .collect();

            if inliers.len() >= minimal_correspondences
                && best
                    .as_ref()
                    .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len())
            {
                best = Some((pose, inliers));
            }
        }
    }

    best
}

/// Orientation RANSAC over two-point hypotheses for pure-rotation frames.
///
/// Each hypothesis aligns the two object-point directions with the two
/// observation bearings; the consensus is the reprojection error under a
/// zero-translation pose.
pub fn orientation_ransac<R: Rng + ?Sized>(
    camera: &Camera,
    object_points: &[Point3<f64>],
    image_points: &[Vector2<f64>],
    rng: &mut R,
    minimal_correspondences: usize,
    iterations: usize,
    max_sqr_error: f64,
) -> Option<(UnitQuaternion<f64>, Vec<usize>)> {
    debug_assert_eq!(object_points.len(), image_points.len());

    let count = object_points.len();
    if count < minimal_correspondences.max(2) {
        return None;
    }

    let mut best: Option<(UnitQuaternion<f64>, Vec<usize>)> = None;

    for _ in 0..iterations {
        let sample = sample_indices(rng, count, 2);

        let Some(rotation) = orientation_from_two(
            camera,
            &[object_points[sample[0]], object_points[sample[1]]],
            &[image_points[sample[0]], image_points[sample[1]]],
        ) else {
            continue;
        };

        let pose = Isometry3::from_parts(Translation3::identity(), rotation);

        let inliers: Vec<usize> = (0..count)
            .filter(|&n| {
                let error =
                    (camera.project(&pose, &object_points[n]) - image_points[n]).norm_squared();
                error.is_finite() && error <= max_sqr_error
            })
            .collect();

        if inliers.len() >= minimal_correspondences
            && best
                .as_ref()
                .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len())
        {
            best = Some((rotation, inliers));
        }
    }

    best
}

/// The standard `world_R_camera` orientation aligning two observation
/// bearings with two object-point directions.
fn orientation_from_two(
    camera: &Camera,
    object_points: &[Point3<f64>; 2],
    image_points: &[Vector2<f64>; 2],
) -> Option<UnitQuaternion<f64>> {
    // Observation directions in the standard camera frame.
    let identity = Isometry3::identity();
    let (_, bearing_a) = camera.ray(&identity, &image_points[0]);
    let (_, bearing_b) = camera.ray(&identity, &image_points[1]);

    let world_a = object_points[0].coords.normalize();
    let world_b = object_points[1].coords.normalize();

    let camera_triad = orthonormal_triad(&bearing_a.into_inner(), &bearing_b.into_inner())?;
    let world_triad = orthonormal_triad(&world_a, &world_b)?;

    // world_R_camera maps camera-frame bearings onto world directions.
    let rotation = world_triad * camera_triad.transpose();
    Some(UnitQuaternion::from_rotation_matrix(
        &Rotation3::from_matrix_unchecked(rotation),
    ))
}

fn orthonormal_triad(
    first: &Vector3<f64>,
    second: &Vector3<f64>,
) -> Option<nalgebra::Matrix3<f64>> {
    let x = first.normalize();
    let z = first.cross(second);
    if z.norm() < 1e-9 {
        return None;
    }
    let z = z.normalize();
    let y = z.cross(&x);

    Some(nalgebra::Matrix3::from_columns(&[x, y, z]))
}

/// Object-point RANSAC: two-observation midpoint triangulations scored by
/// the reprojection error over all observing poses.
pub fn object_point_ransac<R: Rng + ?Sized>(
    camera: &Camera,
    world_t_cameras: &[Isometry3<f64>],
    image_points: &[Vector2<f64>],
    rng: &mut R,
    iterations: usize,
    max_sqr_error: f64,
    minimal_valid: usize,
) -> Option<(Point3<f64>, Vec<usize>)> {
    debug_assert_eq!(world_t_cameras.len(), image_points.len());

    let count = world_t_cameras.len();
    if count < 2 || minimal_valid < 2 {
        return None;
    }

    let mut best: Option<(Point3<f64>, Vec<usize>)> = None;

    for _ in 0..iterations {
        let sample = if count == 2 {
            vec![0, 1]
        } else {
            sample_indices(rng, count, 2)
        };

        let Some(point) = triangulate_midpoint(
            camera,
            &world_t_cameras[sample[0]],
            &world_t_cameras[sample[1]],
            &image_points[sample[0]],
            &image_points[sample[1]],
        ) else {
            continue;
        };

        let inliers: Vec<usize> = (0..count)
            .filter(|&n| {
                let error = (camera.project(&world_t_cameras[n], &point) - image_points[n])
                    .norm_squared();
                error.is_finite() && error <= max_sqr_error
            })
            .collect();

        if inliers.len() >= minimal_valid
            && best
                .as_ref()
                .map_or(true, |(_, best_inliers)| inliers.len() > best_inliers.len())
        {
            best = Some((point, inliers));
        }
    }

    best
}
