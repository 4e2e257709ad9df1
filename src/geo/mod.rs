use crate::models::route::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Meters per degree, applied to both axes. Good enough for vehicle
/// tracking thresholds, not for geodesy.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

pub fn planar_displacement_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let dy = (b.lat - a.lat) * METERS_PER_DEGREE;
    let dx = (b.lng - a.lng) * METERS_PER_DEGREE;
    (dx * dx + dy * dy).sqrt()
}

pub fn path_length_km(points: &[GeoPoint]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_km(&pair[0], &pair[1]))
        .sum()
}
