//! Manifest schema codec: textual row format, YAML ingest, and validation
//! (spec §4.G).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Deserialize;

use crate::model::PropertyType;
use crate::Error;

/// One property entry in a node's manifest. Indices are assigned
/// implicitly by position (1-based, contiguous); see `Manifest::parse*`.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub index: u8,
    pub name: String,
    pub r#type: PropertyType,
    pub unit: String,
    pub offset_str: String,
    pub scale_str: String,
    pub range_str: (String, String),
    pub operations_str: String,
    pub additional_attributes: BTreeMap<String, serde_yaml::Value>,
}

impl Property {
    pub fn readable(&self) -> bool {
        self.operations_str.contains('r')
    }

    pub fn writable(&self) -> bool {
        self.operations_str.contains('w')
    }

    pub fn offset(&self) -> Result<f64, Error> {
        parse_finite(&self.offset_str, "offset", &self.name)
    }

    pub fn scale(&self) -> Result<f64, Error> {
        parse_finite(&self.scale_str, "scale", &self.name)
    }

    pub fn range(&self) -> Result<(f64, f64), Error> {
        Ok((
            parse_finite(&self.range_str.0, "minimum", &self.name)?,
            parse_finite(&self.range_str.1, "maximum", &self.name)?,
        ))
    }
}

fn parse_finite(s: &str, what: &str, property_name: &str) -> Result<f64, Error> {
    let value: f64 = s
        .parse()
        .map_err(|_| Error::Protocol(format!("property {property_name}: {what} '{s}' not a valid numeric value")))?;
    if !value.is_finite() {
        return Err(Error::Protocol(format!(
            "property {property_name}: {what} '{s}' is not finite"
        )));
    }
    Ok(value)
}

/// A node's self-describing property list, immutable after parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub device_name: String,
    pub properties: Vec<Property>,
    by_name: HashMap<String, usize>,
}

impl Manifest {
    pub fn new(device_name: String, properties: Vec<Property>) -> Self {
        let by_name = properties
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        Manifest {
            device_name,
            properties,
            by_name,
        }
    }

    pub fn property(&self, index: u8) -> Option<&Property> {
        self.properties.iter().find(|p| p.index == index)
    }

    pub fn property_by_name(&self, name: &str) -> Option<&Property> {
        self.by_name.get(name).map(|&i| &self.properties[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }
}

/// Parse the LF-delimited textual row format. Line 1 is the device name;
/// each subsequent non-empty line is 8 comma-separated fields. Commas
/// inside fields are not supported. Trailing blank lines are skipped.
pub fn parse_manifest_draft_csv(encoded: &[u8]) -> Result<Manifest, Error> {
    let decoded = std::str::from_utf8(encoded)
        .map_err(|e| Error::Protocol(format!("manifest body is not valid UTF-8: {e}")))?;

    let mut lines = decoded.split('\n');
    let device_name = lines
        .next()
        .ok_or_else(|| Error::Protocol("manifest body is empty".into()))?
        .to_string();

    let mut properties = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 8 {
            return Err(Error::Protocol(format!(
                "manifest row has {} fields, expected 8: {line:?}",
                fields.len()
            )));
        }
        let [name, type_code, unit, offset_str, scale_str, min_str, max_str, operations_str] =
            [fields[0], fields[1], fields[2], fields[3], fields[4], fields[5], fields[6], fields[7]];

        let ty = type_code
            .chars()
            .next()
            .filter(|_| type_code.chars().count() == 1)
            .and_then(PropertyType::from_code)
            .ok_or_else(|| Error::Protocol(format!("unknown property type code {type_code:?}")))?;

        properties.push(Property {
            index: 1 + properties.len() as u8,
            name: name.to_string(),
            r#type: ty,
            unit: unit.to_string(),
            offset_str: offset_str.to_string(),
            scale_str: scale_str.to_string(),
            range_str: (min_str.to_string(), max_str.to_string()),
            operations_str: operations_str.to_string(),
            additional_attributes: BTreeMap::new(),
        });
    }

    Ok(Manifest::new(device_name, properties))
}

pub fn serialize_manifest_draft_csv(manifest: &Manifest) -> Vec<u8> {
    let mut s = manifest.device_name.clone();
    s.push('\n');
    for p in &manifest.properties {
        s.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            p.name, p.r#type.code(), p.unit, p.offset_str, p.scale_str, p.range_str.0, p.range_str.1, p.operations_str
        ));
    }
    s.into_bytes()
}

#[derive(Debug, Deserialize)]
struct YamlManifest {
    device_name: String,
    properties: Vec<YamlProperty>,
}

#[derive(Debug, Deserialize)]
struct YamlProperty {
    name: String,
    r#type: String,
    unit: Option<String>,
    offset: Option<serde_yaml::Value>,
    scale: Option<serde_yaml::Value>,
    range: Option<(serde_yaml::Value, serde_yaml::Value)>,
    #[serde(flatten)]
    additional_attributes: BTreeMap<String, serde_yaml::Value>,
}

fn value_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                n.as_f64().unwrap_or(0.0).to_string()
            }
        }
        serde_yaml::Value::String(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

/// Ingest a YAML manifest (`{device_name, properties: [...]}`). `type` is a
/// space-separated token list mixing one type name with at most one of
/// `readonly`/`writeonly`; absence of both means `rw`. Defaults:
/// `unit=""`, `offset=0`, `scale=1`, `range = type.raw_range()`.
pub fn parse_manifest_yaml(input: &str) -> Result<Manifest, Error> {
    let doc: YamlManifest =
        serde_yaml::from_str(input).map_err(|e| Error::Protocol(format!("invalid manifest YAML: {e}")))?;

    let mut properties = Vec::with_capacity(doc.properties.len());
    for yp in doc.properties {
        let mut operations_str: Option<&'static str> = None;
        let mut ty: Option<PropertyType> = None;
        for token in yp.r#type.split_whitespace() {
            match token {
                "readonly" => {
                    if operations_str.is_some() {
                        return Err(Error::Protocol(format!(
                            "property {}: type specifies conflicting access modifiers",
                            yp.name
                        )));
                    }
                    operations_str = Some("r");
                }
                "writeonly" => {
                    if operations_str.is_some() {
                        return Err(Error::Protocol(format!(
                            "property {}: type specifies conflicting access modifiers",
                            yp.name
                        )));
                    }
                    operations_str = Some("w");
                }
                other => {
                    ty = Some(PropertyType::from_name(other).ok_or_else(|| {
                        Error::Protocol(format!("property {}: unknown type token {other:?}", yp.name))
                    })?);
                }
            }
        }
        let ty = ty.ok_or_else(|| Error::Protocol(format!("property {}: no type specified", yp.name)))?;
        let operations_str = operations_str.unwrap_or("rw").to_string();

        let offset_str = yp
            .offset
            .as_ref()
            .map(value_to_string)
            .unwrap_or_else(|| "0".to_string());
        let scale_str = yp
            .scale
            .as_ref()
            .map(value_to_string)
            .unwrap_or_else(|| "1".to_string());
        let range_str = match &yp.range {
            Some((min, max)) => (value_to_string(min), value_to_string(max)),
            None => {
                let raw = ty.raw_range();
                (raw.start().to_string(), raw.end().to_string())
            }
        };

        properties.push(Property {
            index: 1 + properties.len() as u8,
            name: yp.name,
            r#type: ty,
            unit: yp.unit.unwrap_or_default(),
            offset_str,
            scale_str,
            range_str,
            operations_str,
            additional_attributes: yp.additional_attributes,
        });
    }

    Ok(Manifest::new(doc.device_name, properties))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub message: String,
    pub property_name: Option<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.property_name {
            write!(f, "property {name}: {}", self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Validate a manifest's properties, accumulating every issue found
/// instead of stopping at the first (spec §4.G).
pub fn validate_manifest(manifest: &Manifest) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen_names: HashMap<&str, usize> = HashMap::new();

    for property in &manifest.properties {
        *seen_names.entry(property.name.as_str()).or_insert(0) += 1;

        let error = |message: String| ValidationError {
            message,
            property_name: Some(property.name.clone()),
        };

        let offset: Option<f64> = property.offset_str.parse().ok();
        if offset.is_none() {
            errors.push(error(format!(
                "offset '{}' not a valid numeric value",
                property.offset_str
            )));
        }
        let scale: Option<f64> = property.scale_str.parse().ok();
        if scale.is_none() {
            errors.push(error(format!(
                "scale '{}' not a valid numeric value",
                property.scale_str
            )));
        }
        let min: Option<f64> = property.range_str.0.parse().ok();
        if min.is_none() {
            errors.push(error(format!(
                "minimum '{}' not a valid numeric value",
                property.range_str.0
            )));
        }
        let max: Option<f64> = property.range_str.1.parse().ok();
        if max.is_none() {
            errors.push(error(format!(
                "maximum '{}' not a valid numeric value",
                property.range_str.1
            )));
        }

        if let Some(scale) = scale {
            if scale.abs() < 1e-5 {
                errors.push(error("scale must not be zero".to_string()));
            }
        }

        if let (Some(offset), Some(scale)) = (offset, scale) {
            let raw = property.r#type.raw_range();
            let min_value = offset + *raw.start() as f64 * scale;
            let max_value = offset + *raw.end() as f64 * scale;

            if let Some(min) = min {
                if min < min_value {
                    errors.push(error(format!(
                        "specified minimum {min:.3} outside of expressable range [{min_value:.3}; {max_value:.3}]"
                    )));
                }
            }
            if let Some(max) = max {
                if max > max_value {
                    errors.push(error(format!(
                        "specified maximum {max:.3} outside of expressable range [{min_value:.3}; {max_value:.3}]"
                    )));
                }
            }
        }

        if let (Some(min), Some(max)) = (min, max) {
            if min >= max {
                errors.push(error("maximum must be larger than minimum".to_string()));
            }
        }

        if property.name.is_empty()
            || !property
                .name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            || !property
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            errors.push(error(format!(
                "name '{}' is not a valid identifier",
                property.name
            )));
        }
    }

    for (name, count) in seen_names {
        if count > 1 {
            errors.push(ValidationError {
                message: format!("property name '{name}' is used {count} times"),
                property_name: None,
            });
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trip_empty_device() {
        let m = parse_manifest_draft_csv(b"Silly-Name\n").unwrap();
        assert_eq!(m.device_name, "Silly-Name");
        assert!(m.properties.is_empty());
    }

    #[test]
    fn csv_round_trip_with_properties() {
        let body = b"Widget\nvoltage,H,mV,0,0.1,0,6553.5,r\ncurrent,h,mA,0,1,-100,100,rw\n";
        let m = parse_manifest_draft_csv(body).unwrap();
        assert_eq!(m.properties.len(), 2);
        assert_eq!(m.properties[0].index, 1);
        assert_eq!(m.properties[1].index, 2);
        assert!(m.properties[0].readable());
        assert!(!m.properties[0].writable());
        assert!(m.properties[1].readable() && m.properties[1].writable());
        assert_eq!(serialize_manifest_draft_csv(&m), body.to_vec());
    }

    #[test]
    fn yaml_ingest_defaults() {
        let yaml = r#"
device_name: Widget
properties:
  - name: voltage
    type: uint16 readonly
    unit: mV
"#;
        let m = parse_manifest_yaml(yaml).unwrap();
        let p = &m.properties[0];
        assert_eq!(p.offset_str, "0");
        assert_eq!(p.scale_str, "1");
        assert_eq!(p.range_str, ("0".to_string(), "65535".to_string()));
        assert!(p.readable() && !p.writable());
    }

    #[test]
    fn yaml_ingest_additional_attributes() {
        let yaml = r#"
device_name: Widget
properties:
  - name: voltage
    type: uint16
    codegen_hint: volatile
"#;
        let m = parse_manifest_yaml(yaml).unwrap();
        assert_eq!(
            m.properties[0].additional_attributes.get("codegen_hint").unwrap(),
            &serde_yaml::Value::String("volatile".to_string())
        );
    }

    #[test]
    fn s4_validation_fixture() {
        let yaml = r#"
device_name: Fixture
properties:
  - name: BadMinMax
    type: int8
    range: [-200, 200]
  - name: BadMinMax2
    type: int8
    scale: 0.1
    range: [-20, 20]
  - name: BadRange
    type: int8
    range: [100, 0]
  - name: BadScale
    type: uint8
    scale: 0.000000001
"#;
        let m = parse_manifest_yaml(yaml).unwrap();
        let errors = validate_manifest(&m);
        let strings: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        let joined = strings.join("\n");
        assert!(joined.contains("BadMinMax: specified minimum"));
        assert!(joined.contains("BadMinMax: specified maximum"));
        assert!(joined.contains("BadMinMax2: specified minimum"));
        assert!(joined.contains("BadMinMax2: specified maximum"));
        assert!(joined.contains("BadRange: maximum must be larger than minimum"));
        assert!(joined.contains("BadScale: scale must not be zero"));
    }

    #[test]
    fn validation_flags_duplicate_names() {
        let yaml = r#"
device_name: Fixture
properties:
  - name: voltage
    type: uint16
  - name: voltage
    type: uint8
"#;
        let m = parse_manifest_yaml(yaml).unwrap();
        let errors = validate_manifest(&m);
        assert!(errors.iter().any(|e| e.message.contains("used 2 times")));
    }
}
