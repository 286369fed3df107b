//! Country lookups for geolocated search and per-country source catalogs.

use crate::error::{CollectError, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Country names accepted for geolocation, with their search `gl` codes.
const COUNTRY_CODES: &[(&str, &str)] = &[
    ("Afghanistan", "af"),
    ("Albania", "al"),
    ("Algeria", "dz"),
    ("American Samoa", "as"),
    ("Andorra", "ad"),
    ("Angola", "ao"),
    ("Anguilla", "ai"),
    ("Antigua and Barbuda", "ag"),
    ("Argentina", "ar"),
    ("Armenia", "am"),
    ("Aruba", "aw"),
    ("Australia", "au"),
    ("Austria", "at"),
    ("Azerbaijan", "az"),
    ("Bahamas", "bs"),
    ("Bahrain", "bh"),
    ("Bangladesh", "bd"),
    ("Barbados", "bb"),
    ("Belarus", "by"),
    ("Belgium", "be"),
    ("Belize", "bz"),
    ("Benin", "bj"),
    ("Bermuda", "bm"),
    ("Bhutan", "bt"),
    ("Bolivia", "bo"),
    ("Bosnia and Herzegovina", "ba"),
    ("Botswana", "bw"),
    ("Brazil", "br"),
    ("Brunei", "bn"),
    ("Bulgaria", "bg"),
    ("Burkina Faso", "bf"),
    ("Burundi", "bi"),
    ("Cambodia", "kh"),
    ("Cameroon", "cm"),
    ("Canada", "ca"),
    ("Cape Verde", "cv"),
    ("Cayman Islands", "ky"),
    ("Central African Republic", "cf"),
    ("Chad", "td"),
    ("Chile", "cl"),
    ("China", "cn"),
    ("Colombia", "co"),
    ("Comoros", "km"),
    ("Congo", "cg"),
    ("Costa Rica", "cr"),
    ("Cote d'Ivoire", "ci"),
    ("Croatia", "hr"),
    ("Cuba", "cu"),
    ("Cyprus", "cy"),
    ("Czech Republic", "cz"),
    ("Democratic Republic of the Congo", "cd"),
    ("Denmark", "dk"),
    ("Djibouti", "dj"),
    ("Dominica", "dm"),
    ("Dominican Republic", "do"),
    ("Ecuador", "ec"),
    ("Egypt", "eg"),
    ("El Salvador", "sv"),
    ("Equatorial Guinea", "gq"),
    ("Eritrea", "er"),
    ("Estonia", "ee"),
    ("Eswatini", "sz"),
    ("Ethiopia", "et"),
    ("Fiji", "fj"),
    ("Finland", "fi"),
    ("France", "fr"),
    ("French Guiana", "gf"),
    ("French Polynesia", "pf"),
    ("Gabon", "ga"),
    ("Gambia", "gm"),
    ("Georgia", "ge"),
    ("Germany", "de"),
    ("Ghana", "gh"),
    ("Gibraltar", "gi"),
    ("Greece", "gr"),
    ("Greenland", "gl"),
    ("Grenada", "gd"),
    ("Guadeloupe", "gp"),
    ("Guam", "gu"),
    ("Guatemala", "gt"),
    ("Guernsey", "gg"),
    ("Guinea", "gn"),
    ("Guinea-Bissau", "gw"),
    ("Guyana", "gy"),
    ("Haiti", "ht"),
    ("Honduras", "hn"),
    ("Hong Kong", "hk"),
    ("Hungary", "hu"),
    ("Iceland", "is"),
    ("India", "in"),
    ("Indonesia", "id"),
    ("Iran", "ir"),
    ("Iraq", "iq"),
    ("Ireland", "ie"),
    ("Isle of Man", "im"),
    ("Israel", "il"),
    ("Italy", "it"),
    ("Jamaica", "jm"),
    ("Japan", "jp"),
    ("Jersey", "je"),
    ("Jordan", "jo"),
    ("Kazakhstan", "kz"),
    ("Kenya", "ke"),
    ("Kiribati", "ki"),
    ("Kosovo", "xk"),
    ("Kuwait", "kw"),
    ("Kyrgyzstan", "kg"),
    ("Laos", "la"),
    ("Latvia", "lv"),
    ("Lebanon", "lb"),
    ("Lesotho", "ls"),
    ("Liberia", "lr"),
    ("Libya", "ly"),
    ("Liechtenstein", "li"),
    ("Lithuania", "lt"),
    ("Luxembourg", "lu"),
    ("Macau", "mo"),
    ("Madagascar", "mg"),
    ("Malawi", "mw"),
    ("Malaysia", "my"),
    ("Maldives", "mv"),
    ("Mali", "ml"),
    ("Malta", "mt"),
    ("Marshall Islands", "mh"),
    ("Martinique", "mq"),
    ("Mauritania", "mr"),
    ("Mauritius", "mu"),
    ("Mexico", "mx"),
    ("Micronesia", "fm"),
    ("Moldova", "md"),
    ("Monaco", "mc"),
    ("Mongolia", "mn"),
    ("Montenegro", "me"),
    ("Montserrat", "ms"),
    ("Morocco", "ma"),
    ("Mozambique", "mz"),
    ("Myanmar", "mm"),
    ("Namibia", "na"),
    ("Nauru", "nr"),
    ("Nepal", "np"),
    ("Netherlands", "nl"),
    ("New Caledonia", "nc"),
    ("New Zealand", "nz"),
    ("Nicaragua", "ni"),
    ("Niger", "ne"),
    ("Nigeria", "ng"),
    ("North Korea", "kp"),
    ("North Macedonia", "mk"),
    ("Northern Mariana Islands", "mp"),
    ("Norway", "no"),
    ("Oman", "om"),
    ("Pakistan", "pk"),
    ("Palau", "pw"),
    ("Palestine", "ps"),
    ("Panama", "pa"),
    ("Papua New Guinea", "pg"),
    ("Paraguay", "py"),
    ("Peru", "pe"),
    ("Philippines", "ph"),
    ("Poland", "pl"),
    ("Portugal", "pt"),
    ("Puerto Rico", "pr"),
    ("Qatar", "qa"),
    ("Reunion", "re"),
    ("Romania", "ro"),
    ("Russia", "ru"),
    ("Rwanda", "rw"),
    ("Saint Kitts and Nevis", "kn"),
    ("Saint Lucia", "lc"),
    ("Saint Vincent and the Grenadines", "vc"),
    ("Samoa", "ws"),
    ("San Marino", "sm"),
    ("Sao Tome and Principe", "st"),
    ("Saudi Arabia", "sa"),
    ("Senegal", "sn"),
    ("Serbia", "rs"),
    ("Seychelles", "sc"),
    ("Sierra Leone", "sl"),
    ("Singapore", "sg"),
    ("Slovakia", "sk"),
    ("Slovenia", "si"),
    ("Solomon Islands", "sb"),
    ("Somalia", "so"),
    ("South Africa", "za"),
    ("South Korea", "kr"),
    ("South Sudan", "ss"),
    ("Spain", "es"),
    ("Sri Lanka", "lk"),
    ("Sudan", "sd"),
    ("Suriname", "sr"),
    ("Sweden", "se"),
    ("Switzerland", "ch"),
    ("Syria", "sy"),
    ("Taiwan", "tw"),
    ("Tajikistan", "tj"),
    ("Tanzania", "tz"),
    ("Thailand", "th"),
    ("Timor-Leste", "tl"),
    ("Togo", "tg"),
    ("Tonga", "to"),
    ("Trinidad and Tobago", "tt"),
    ("Tunisia", "tn"),
    ("Turkey", "tr"),
    ("Turkmenistan", "tm"),
    ("Turks and Caicos Islands", "tc"),
    ("Tuvalu", "tv"),
    ("Uganda", "ug"),
    ("Ukraine", "ua"),
    ("United Arab Emirates", "ae"),
    ("United Kingdom", "gb"),
    ("United States", "us"),
    ("Uruguay", "uy"),
    ("Uzbekistan", "uz"),
    ("Vanuatu", "vu"),
    ("Vatican City", "va"),
    ("Venezuela", "ve"),
    ("Vietnam", "vn"),
    ("Virgin Islands, British", "vg"),
    ("Virgin Islands, U.S.", "vi"),
    ("Yemen", "ye"),
    ("Zambia", "zm"),
    ("Zimbabwe", "zw"),
];

/// Search geolocation code for a country name (case-insensitive).
pub fn country_code(country: &str) -> Result<&'static str, ConfigError> {
    let wanted = country.trim();
    COUNTRY_CODES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
        .map(|(_, code)| *code)
        .ok_or_else(|| ConfigError::UnknownCountry(country.to_string()))
}

/// Country names usable for geolocation.
pub fn geolocation_countries() -> Vec<&'static str> {
    COUNTRY_CODES.iter().map(|(name, _)| *name).collect()
}

/// Per-country lists of news sources, e.g. a media collection export.
///
/// Loaded from a JSON object mapping a country name to site domains.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SourceCatalog {
    collections: BTreeMap<String, Vec<String>>,
}

impl SourceCatalog {
    pub fn from_json_str(raw: &str) -> Result<Self, CollectError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CollectError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn countries(&self) -> Vec<&str> {
        self.collections.keys().map(String::as_str).collect()
    }

    pub fn sources_for(&self, country: &str) -> Result<&[String], ConfigError> {
        let wanted = country.trim();
        self.collections
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, sources)| sources.as_slice())
            .ok_or_else(|| ConfigError::UnknownSourceCollection(country.to_string()))
    }
}
