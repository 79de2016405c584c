use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Coordinates `(latitude, longitude)` of the cities the weather module
/// serves. Lookup is by exact name, with the common `市` suffix tolerated
/// in both directions.
static CITY_COORDINATES: Lazy<HashMap<&'static str, (f64, f64)>> = Lazy::new(|| {
    HashMap::from([
        // Hubei
        ("孝感", (30.9246, 113.9169)),
        ("宜昌", (30.7026, 111.2865)),
        ("武汉", (30.5928, 114.3055)),
        ("荆州", (30.3352, 112.2397)),
        ("荆门", (31.0354, 112.1994)),
        ("襄阳", (32.0088, 112.1224)),
        ("随州", (31.6901, 113.3825)),
        ("黄冈", (30.4539, 114.8724)),
        // Major cities
        ("北京", (39.9042, 116.4074)),
        ("上海", (31.2304, 121.4737)),
        ("广州", (23.1291, 113.2644)),
        ("深圳", (22.5431, 114.0579)),
        ("杭州", (30.2741, 120.1551)),
        ("成都", (30.6624, 104.0633)),
        ("重庆", (29.5630, 106.5516)),
        ("西安", (34.3416, 108.9398)),
        ("南京", (32.0603, 118.7969)),
        ("天津", (39.3434, 117.2008)),
    ])
});

/// Resolves a city name to coordinates. Returns `None` for cities outside
/// the table; callers count those as failed targets.
pub fn coordinates_for(city: &str) -> Option<(f64, f64)> {
    let city = city.trim();
    if let Some(coords) = CITY_COORDINATES.get(city) {
        return Some(*coords);
    }

    let with_suffix = format!("{city}市");
    if let Some(coords) = CITY_COORDINATES.get(with_suffix.as_str()) {
        return Some(*coords);
    }

    if let Some(stripped) = city.strip_suffix('市') {
        if let Some(coords) = CITY_COORDINATES.get(stripped) {
            return Some(*coords);
        }
    }

    None
}

pub fn known_city(city: &str) -> bool {
    coordinates_for(city).is_some()
}
