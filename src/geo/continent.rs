//! Fixed continent groupings by two-letter country code

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continent {
    Asia,
    Africa,
    NorthAmerica,
    SouthAmerica,
    Europe,
    Pacific,
}

static ASIA: &[&str] = &[
    "AE", "AF", "AL", "AZ", "BD", "BH", "BN", "BT", "CN", "CY", "HK", "ID", "IL", "IN", "IQ",
    "IR", "JO", "JP", "KH", "KP", "KR", "KW", "KZ", "LA", "LB", "LU", "MN", "MO", "MV", "MY",
    "NP", "OM", "PH", "PK", "QA", "SA", "SG", "SY", "TH", "TJ", "TM", "TW", "UZ", "VN", "YE",
];

static AFRICA: &[&str] = &[
    "AO", "BI", "BJ", "BW", "CF", "CG", "CM", "CV", "DZ", "EG", "ET", "GA", "GH", "GM", "GN",
    "GQ", "KE", "LY", "MA", "MG", "ML", "MR", "MU", "MZ", "NA", "NE", "NG", "RW", "SD", "SN",
    "SO", "TN", "TZ", "UG", "ZA", "ZM", "ZR", "ZW",
];

static NORTH_AMERICA: &[&str] = &[
    "BM", "BS", "CA", "CR", "CU", "GD", "GT", "HN", "HT", "JM", "MX", "NI", "PA", "US", "VE",
];

static SOUTH_AMERICA: &[&str] = &["AR", "BO", "BR", "CL", "CO", "EC", "GY", "PE", "PY", "UY"];

static EUROPE: &[&str] = &[
    "AT", "BE", "BG", "CH", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GB", "GR", "HR", "HU",
    "IE", "IS", "IT", "LT", "LV", "MC", "MD", "MT", "NL", "NO", "PL", "PT", "RO", "RU", "SE",
    "SK", "SM", "UA", "UK", "VA", "YU",
];

static PACIFIC: &[&str] = &["AU", "CK", "FJ", "GU", "NZ", "PG", "TO"];

static CONTINENTS: &[(Continent, &[&str])] = &[
    (Continent::Asia, ASIA),
    (Continent::Africa, AFRICA),
    (Continent::NorthAmerica, NORTH_AMERICA),
    (Continent::SouthAmerica, SOUTH_AMERICA),
    (Continent::Europe, EUROPE),
    (Continent::Pacific, PACIFIC),
];

/// Continent a country code belongs to, if it is in one of the groupings
pub fn continent_of(country_code: &str) -> Option<Continent> {
    CONTINENTS
        .iter()
        .find(|(_, members)| {
            members
                .iter()
                .any(|code| code.eq_ignore_ascii_case(country_code))
        })
        .map(|(continent, _)| *continent)
}

pub fn same_continent(a: &str, b: &str) -> bool {
    match (continent_of(a), continent_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continent_of() {
        assert_eq!(continent_of("JP"), Some(Continent::Asia));
        assert_eq!(continent_of("de"), Some(Continent::Europe));
        assert_eq!(continent_of("US"), Some(Continent::NorthAmerica));
        assert_eq!(continent_of("BR"), Some(Continent::SouthAmerica));
        assert_eq!(continent_of("EG"), Some(Continent::Africa));
        assert_eq!(continent_of("NZ"), Some(Continent::Pacific));
        assert_eq!(continent_of("AQ"), None);
    }

    #[test]
    fn test_same_continent() {
        assert!(same_continent("JP", "HK"));
        assert!(same_continent("fr", "DE"));
        assert!(!same_continent("JP", "US"));
        assert!(!same_continent("AQ", "AQ"));
    }
}
