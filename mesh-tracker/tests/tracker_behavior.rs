//! Tracker state-machine behavior with a synthetic planar-scene backend.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use mesh_tracker::{
    MatchedPoint, MeshTrackerCore, TexturedTriMesh, TrackerOptions, TrackingBackend,
};
use sfm_camera::Camera;

/// A synthetic frame: the ground-truth `world_T_camera` pose per scene
/// object (`None` = object not visible), plus the camera for projection.
#[derive(Clone)]
struct SimFrame {
    camera: Camera,
    object_poses: Vec<Option<Isometry3<f64>>>,
}

/// Backend simulating a planar textured scene: features and tracking are
/// derived analytically from the ground-truth poses carried by the frames.
struct SimBackend {
    meshes: RefCell<Vec<TexturedTriMesh>>,
    extract_calls: Rc<RefCell<usize>>,
}

impl SimBackend {
    fn new() -> (Self, Rc<RefCell<usize>>) {
        let extract_calls = Rc::new(RefCell::new(0));
        (
            Self {
                meshes: RefCell::new(Vec::new()),
                extract_calls: Rc::clone(&extract_calls),
            },
            extract_calls,
        )
    }

    /// Sample texture points spread over the unit-square mesh.
    fn sample_uvs() -> Vec<Vector2<f64>> {
        let mut uvs = Vec::new();
        for x in 0..3 {
            for y in 0..3 {
                uvs.push(Vector2::new(
                    10.0 + x as f64 * 40.0,
                    10.0 + y as f64 * 40.0,
                ));
            }
        }
        uvs
    }
}

impl TrackingBackend for SimBackend {
    type Frame = SimFrame;
    /// The scene index assigned at registration.
    type FeatureMap = usize;
    type Features = SimFrame;

    fn build_feature_map(&self, _texture: &SimFrame, mesh: &TexturedTriMesh) -> usize {
        let mut meshes = self.meshes.borrow_mut();
        meshes.push(mesh.clone());
        meshes.len() - 1
    }

    fn reference_points(&self, _texture: &SimFrame, pyramid_levels: usize) -> Vec<Vec<Vector2<f64>>> {
        vec![Self::sample_uvs(); pyramid_levels]
    }

    fn extract_features(&self, frame: &SimFrame, _max_features: usize) -> SimFrame {
        *self.extract_calls.borrow_mut() += 1;
        frame.clone()
    }

    fn match_features(&self, map: &usize, features: &SimFrame) -> Vec<MatchedPoint> {
        let Some(pose) = features.object_poses[*map] else {
            return Vec::new();
        };

        let meshes = self.meshes.borrow();
        let mesh = &meshes[*map];

        let mut matches = Vec::new();
        for uv in Self::sample_uvs() {
            if let Some((triangle_index, object_point)) = mesh.lift(&uv) {
                let image_point = features.camera.project(&pose, &object_point);
                if features.camera.is_inside(&image_point) {
                    matches.push(MatchedPoint {
                        object_point,
                        image_point,
                        triangle_index,
                    });
                }
            }
        }
        matches
    }

    fn track_points(
        &self,
        previous: &SimFrame,
        current: &SimFrame,
        points: &[Vector2<f64>],
        _rotation_previous_t_current: Option<&UnitQuaternion<f64>>,
    ) -> Vec<Option<Vector2<f64>>> {
        // The scene is the z = 0 plane of object 0; a point survives while
        // the object stays visible.
        let (Some(previous_pose), Some(current_pose)) =
            (previous.object_poses[0], current.object_poses[0])
        else {
            return vec![None; points.len()];
        };

        points
            .iter()
            .map(|point| {
                let (origin, direction) = previous.camera.ray(&previous_pose, point);
                if direction.z.abs() < 1e-12 {
                    return None;
                }
                let t = -origin.z / direction.z;
                if t <= 0.0 {
                    return None;
                }
                let surface = Point3::from(origin.coords + direction.into_inner() * t);
                let tracked = current.camera.project(&current_pose, &surface);
                current.camera.is_inside(&tracked).then_some(tracked)
            })
            .collect()
    }

    fn rectify_triangle(
        &self,
        frame: &SimFrame,
        camera: &Camera,
        _world_t_camera: &Isometry3<f64>,
        mesh: &TexturedTriMesh,
        triangle_index: usize,
    ) -> Option<(usize, Vec<MatchedPoint>)> {
        let pose = frame.object_poses[0]?;

        let mut matches = Vec::new();
        for uv in Self::sample_uvs() {
            if let Some(object_point) = mesh.lift_in_triangle(triangle_index, &uv) {
                matches.push(MatchedPoint {
                    object_point,
                    image_point: camera.project(&pose, &object_point),
                    triangle_index,
                });
            }
        }
        Some((0, matches))
    }
}

fn camera() -> Camera {
    Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap()
}

fn unit_square_mesh() -> TexturedTriMesh {
    TexturedTriMesh::new(
        vec![[0, 1, 2], [0, 2, 3]],
        vec![
            [-0.5, -0.5, 0.0],
            [0.5, -0.5, 0.0],
            [0.5, 0.5, 0.0],
            [-0.5, 0.5, 0.0],
        ],
        vec![[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]],
    )
    .unwrap()
}

/// The camera hovers 2 m in front of the planar object, slowly strafing.
fn visible_pose(frame_index: usize) -> Isometry3<f64> {
    Isometry3::translation(frame_index as f64 * 0.002, 0.0, 2.0)
}

fn texture_frame(camera: &Camera, objects: usize) -> SimFrame {
    SimFrame {
        camera: camera.clone(),
        object_poses: vec![None; objects],
    }
}

#[test]
fn recognition_cadence_and_reacquisition() {
    let camera = camera();
    let (backend, extract_calls) = SimBackend::new();
    let mut rng = ChaCha8Rng::seed_from_u64(8);

    let options = TrackerOptions {
        recognition_cadence_without_tracked_objects: 0.1,
        ..Default::default()
    };

    let mut tracker = MeshTrackerCore::new(backend, options);
    let texture = texture_frame(&camera, 1);
    let id = tracker.add(&texture, unit_square_mesh(), &mut rng);

    let dt = 1.0 / 30.0;

    // Phase 1: 30 frames without the object; recognition attempts follow
    // the without-tracked-objects cadence.
    for n in 0..30 {
        let frame = SimFrame {
            camera: camera.clone(),
            object_poses: vec![None],
        };
        let results = tracker.track_frame(n as f64 * dt, frame, &camera, true, None, &mut rng);
        assert!(results.is_empty());
    }

    assert_eq!(tracker.object(id).unwrap().tracked_point_count(), 0);

    // ceil(duration / cadence) attempts: at t = 0.0, 0.1, ..., 0.9, i.e.
    // one every third frame at 30 fps.
    assert_eq!(*extract_calls.borrow(), 10);

    // Phase 2: the object appears; recognition must succeed within the
    // first two frames.
    let mut first_tracked_frame = None;
    for n in 30..40 {
        let frame = SimFrame {
            camera: camera.clone(),
            object_poses: vec![Some(visible_pose(n))],
        };
        let results = tracker.track_frame(n as f64 * dt, frame, &camera, true, None, &mut rng);

        if !results.is_empty() && first_tracked_frame.is_none() {
            first_tracked_frame = Some(n);
        }
    }

    let first = first_tracked_frame.expect("object was never recognized");
    assert!(first <= 31, "first tracked frame was {first}");

    // Once tracked, the object stays tracked to the end of the sequence.
    assert_eq!(tracker.tracked_object_count(), 1);
}

#[test]
fn concurrent_tracked_object_limit_is_respected() {
    let camera = camera();
    let (backend, _extract_calls) = SimBackend::new();
    let mut rng = ChaCha8Rng::seed_from_u64(10);

    let options = TrackerOptions {
        concurrent_tracked_object_limit: 1,
        recognition_cadence_without_tracked_objects: 0.0,
        recognition_cadence_with_tracked_objects: 0.0,
        ..Default::default()
    };

    let mut tracker = MeshTrackerCore::new(backend, options);
    let texture = texture_frame(&camera, 3);

    // Three registered objects sharing one visible pose.
    for _ in 0..3 {
        tracker.add(&texture, unit_square_mesh(), &mut rng);
    }

    for n in 0..12 {
        let pose = Some(visible_pose(n));
        let frame = SimFrame {
            camera: camera.clone(),
            object_poses: vec![pose, pose, pose],
        };
        let results = tracker.track_frame(n as f64 / 30.0, frame, &camera, true, None, &mut rng);

        assert!(
            results.len() <= 1,
            "frame {n} tracked {} objects",
            results.len()
        );
        assert!(tracker.tracked_object_count() <= 1);
    }

    // With the cap at one, exactly one object ends up tracked.
    assert_eq!(tracker.tracked_object_count(), 1);
}

#[test]
fn losing_the_object_keeps_the_pose_guess() {
    let camera = camera();
    let (backend, _extract_calls) = SimBackend::new();
    let mut rng = ChaCha8Rng::seed_from_u64(11);

    let options = TrackerOptions {
        recognition_cadence_without_tracked_objects: 0.0,
        ..Default::default()
    };

    let mut tracker = MeshTrackerCore::new(backend, options);
    let texture = texture_frame(&camera, 1);
    let id = tracker.add(&texture, unit_square_mesh(), &mut rng);

    // Track for a few frames.
    for n in 0..5 {
        let frame = SimFrame {
            camera: camera.clone(),
            object_poses: vec![Some(visible_pose(n))],
        };
        tracker.track_frame(n as f64 / 30.0, frame, &camera, true, None, &mut rng);
    }
    assert_eq!(tracker.tracked_object_count(), 1);
    let last_tracked_time = 4.0 / 30.0;

    // The object disappears; recognition is disallowed so nothing can
    // re-acquire it.
    let frame = SimFrame {
        camera: camera.clone(),
        object_poses: vec![None],
    };
    tracker.track_frame(5.0 / 30.0, frame, &camera, false, None, &mut rng);

    assert_eq!(tracker.tracked_object_count(), 0);

    let object = tracker.object(id).unwrap();
    assert!(object.pose_world_t_camera().is_none());
    assert!(object.pose_guess(last_tracked_time + 0.1, 0.5).is_some());
    assert!(object.pose_guess(last_tracked_time + 10.0, 0.5).is_none());

    // A full reset drops the guess as well.
    tracker.untrack_all();
    assert!(tracker.object(id).unwrap().pose_guess(last_tracked_time, 0.5).is_none());
}
