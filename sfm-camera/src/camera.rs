use nalgebra::{Isometry3, OMatrix, Point3, Unit, Vector2, Vector3, Vector5, U1, U2};
use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics};

use crate::pose::standard_to_inverted_flipped;
use crate::{CameraError, Result};

/// A pinhole camera with OpenCV Brown-Conrady distortion.
///
/// The intrinsics live in the ROS/OpenCV container; the projection itself
/// is evaluated explicitly so the Jacobian helpers share the exact same
/// code path.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    width: usize,
    height: usize,
    intrinsics: RosOpenCvIntrinsics<f64>,
}

impl Camera {
    pub fn new(width: usize, height: usize, intrinsics: RosOpenCvIntrinsics<f64>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(CameraError::InvalidImageSize);
        }
        if !(intrinsics.fx() > 0.0) || !(intrinsics.fy() > 0.0) {
            return Err(CameraError::InvalidIntrinsics);
        }

        Ok(Self {
            width,
            height,
            intrinsics,
        })
    }

    /// A distortion-free camera from the four pinhole parameters.
    pub fn from_params(
        width: usize,
        height: usize,
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
    ) -> Result<Self> {
        Self::new(
            width,
            height,
            RosOpenCvIntrinsics::from_params(fx, 0.0, fy, cx, cy),
        )
    }

    /// A camera with two radial and two tangential distortion parameters.
    pub fn from_params_with_distortion(
        width: usize,
        height: usize,
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        k1: f64,
        k2: f64,
        p1: f64,
        p2: f64,
    ) -> Result<Self> {
        let distortion = Distortion::from_opencv_vec(Vector5::new(k1, k2, p1, p2, 0.0));
        Self::new(
            width,
            height,
            RosOpenCvIntrinsics::from_params_with_distortion(fx, 0.0, fy, cx, cy, distortion),
        )
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn intrinsics(&self) -> &RosOpenCvIntrinsics<f64> {
        &self.intrinsics
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.intrinsics.fx()
    }

    #[inline]
    pub fn fy(&self) -> f64 {
        self.intrinsics.fy()
    }

    #[inline]
    pub fn cx(&self) -> f64 {
        self.intrinsics.cx()
    }

    #[inline]
    pub fn cy(&self) -> f64 {
        self.intrinsics.cy()
    }

    #[inline]
    pub fn has_distortion(&self) -> bool {
        !self.intrinsics.distortion.is_linear()
    }

    /// Distortion coefficients `(k1, k2, k3, p1, p2)`.
    #[inline]
    pub fn distortion(&self) -> (f64, f64, f64, f64, f64) {
        let d = &self.intrinsics.distortion;
        (
            d.radial1(),
            d.radial2(),
            d.radial3(),
            d.tangential1(),
            d.tangential2(),
        )
    }

    /// Applies the Brown-Conrady model to normalized image coordinates.
    pub(crate) fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let (k1, k2, k3, p1, p2) = self.distortion();

        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));

        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        (xd, yd)
    }

    /// Projects a normalized (z = 1) point in the projection frame to pixels.
    pub(crate) fn normalized_to_pixel(&self, x: f64, y: f64) -> Vector2<f64> {
        let (xd, yd) = self.distort_normalized(x, y);
        let skew = self.intrinsics.skew();
        Vector2::new(
            self.fx() * xd + skew * yd + self.cx(),
            self.fy() * yd + self.cy(),
        )
    }

    /// Projects a world point given the inverted-flipped transform.
    pub fn project_if(
        &self,
        flipped_camera_t_world: &Isometry3<f64>,
        object_point: &Point3<f64>,
    ) -> Vector2<f64> {
        let p = flipped_camera_t_world * object_point;
        self.normalized_to_pixel(p.x / p.z, p.y / p.z)
    }

    /// Projects a world point given the standard `world_T_camera` pose.
    pub fn project(
        &self,
        world_t_camera: &Isometry3<f64>,
        object_point: &Point3<f64>,
    ) -> Vector2<f64> {
        self.project_if(&standard_to_inverted_flipped(world_t_camera), object_point)
    }

    /// Whether a world point lies in front of the camera, given the
    /// inverted-flipped transform.
    pub fn is_object_point_in_front_if(
        &self,
        flipped_camera_t_world: &Isometry3<f64>,
        object_point: &Point3<f64>,
    ) -> bool {
        (flipped_camera_t_world * object_point).z > f64::EPSILON
    }

    /// Whether a pixel lies inside the image bounds.
    pub fn is_inside(&self, image_point: &Vector2<f64>) -> bool {
        image_point.x >= 0.0
            && image_point.y >= 0.0
            && image_point.x < self.width as f64
            && image_point.y < self.height as f64
    }

    /// Removes the lens distortion from a pixel coordinate.
    pub fn undistort(&self, distorted: &Vector2<f64>) -> Vector2<f64> {
        if !self.has_distortion() {
            return *distorted;
        }

        let pixels = cam_geom::Pixels {
            data: OMatrix::<f64, U1, U2>::new(distorted.x, distorted.y),
        };
        let undistorted = self.intrinsics.undistort(&pixels);
        Vector2::new(undistorted.data[(0, 0)], undistorted.data[(0, 1)])
    }

    /// Normalized projection-frame coordinates (z = 1) of a (distorted)
    /// image point.
    pub fn normalized_coordinates(&self, image_point: &Vector2<f64>) -> Vector2<f64> {
        let undistorted = self.undistort(image_point);

        // The skew enters the x back-substitution.
        let skew = self.intrinsics.skew();
        let yn = (undistorted.y - self.cy()) / self.fy();
        let xn = (undistorted.x - self.cx() - skew * yn) / self.fx();

        Vector2::new(xn, yn)
    }

    /// Unit bearing vector of a (distorted) image point in the projection
    /// frame.
    pub fn bearing_if(&self, image_point: &Vector2<f64>) -> Unit<Vector3<f64>> {
        let normalized = self.normalized_coordinates(image_point);
        Unit::new_normalize(Vector3::new(normalized.x, normalized.y, 1.0))
    }

    /// The world-frame ray through the camera centre and a (distorted) image
    /// point, given the standard pose. The direction has unit length.
    pub fn ray(
        &self,
        world_t_camera: &Isometry3<f64>,
        image_point: &Vector2<f64>,
    ) -> (Point3<f64>, Unit<Vector3<f64>>) {
        let normalized = self.normalized_coordinates(image_point);

        // Projection frame -> standard camera frame (negate y and z).
        let direction_camera = Vector3::new(normalized.x, -normalized.y, -1.0);
        let direction_world = world_t_camera.rotation * direction_camera;

        (
            Point3::from(world_t_camera.translation.vector),
            Unit::new_normalize(direction_world),
        )
    }

    /// The world point at `distance` along the viewing ray of an image
    /// point; used to seat points on unit-depth rays under the rotational
    /// motion hypothesis.
    pub fn object_point_on_ray(
        &self,
        world_t_camera: &Isometry3<f64>,
        image_point: &Vector2<f64>,
        distance: f64,
    ) -> Point3<f64> {
        let (origin, direction) = self.ray(world_t_camera, image_point);
        origin + direction.into_inner() * distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::standard_to_inverted_flipped;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    fn test_camera() -> Camera {
        Camera::from_params_with_distortion(
            640, 480, 520.0, 525.0, 319.5, 239.5, 0.04, -0.012, 0.0008, -0.0004,
        )
        .unwrap()
    }

    fn test_pose() -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.2, -0.1, 0.5),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.05, -0.2, 0.1)),
        )
    }

    #[test]
    fn projection_matches_ray_round_trip() {
        let camera = test_camera();
        let pose = test_pose();

        for point in [
            Point3::new(0.1, 0.2, -2.0),
            Point3::new(-0.4, 0.1, -1.5),
            Point3::new(0.3, -0.3, -3.0),
        ] {
            let pixel = camera.project(&pose, &point);
            assert!(camera.is_inside(&pixel));

            let (origin, direction) = camera.ray(&pose, &pixel);

            // The ray must pass through the original point.
            let to_point = (point - origin).normalize();
            assert_relative_eq!(direction.dot(&to_point), 1.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn undistort_inverts_distortion() {
        let camera = test_camera();

        for (x, y) in [(0.1, -0.05), (-0.2, 0.15), (0.0, 0.0)] {
            let (xd, yd) = camera.distort_normalized(x, y);
            let distorted = Vector2::new(
                camera.fx() * xd + camera.cx(),
                camera.fy() * yd + camera.cy(),
            );

            let undistorted = camera.undistort(&distorted);
            assert_relative_eq!(
                undistorted.x,
                camera.fx() * x + camera.cx(),
                epsilon = 1e-6
            );
            assert_relative_eq!(
                undistorted.y,
                camera.fy() * y + camera.cy(),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn front_test_uses_projection_frame() {
        let camera = test_camera();
        let pose = Isometry3::identity();
        let flipped = standard_to_inverted_flipped(&pose);

        assert!(camera.is_object_point_in_front_if(&flipped, &Point3::new(0.0, 0.0, -1.0)));
        assert!(!camera.is_object_point_in_front_if(&flipped, &Point3::new(0.0, 0.0, 1.0)));
    }
}
