// ----- Geometry -----

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Sum of leg lengths along `points` (lat, lon).
pub fn path_length_m(points: impl IntoIterator<Item = (f64, f64)>) -> f64 {
    let mut total = 0.0;
    let mut prev: Option<(f64, f64)> = None;
    for (lat, lon) in points {
        if let Some((plat, plon)) = prev {
            total += haversine_m(plat, plon, lat, lon);
        }
        prev = Some((lat, lon));
    }
    total
}
