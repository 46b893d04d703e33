use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Separator for hour override keys and matrix cell keys: `course::class::subject`.
pub const KEY_SEP: &str = "::";

fn id_string<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// One subject row of a curriculum preset, as stored in the relational store.
#[derive(Debug, Clone, Deserialize)]
pub struct PresetSubject {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(alias = "nome")]
    pub subject_name: String,
    #[serde(alias = "classe")]
    pub class_label: String,
    #[serde(default, alias = "carga_horaria_semanal")]
    pub weekly_hours: i64,
}

/// A school's customisation of one preset subject.
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectOverride {
    #[serde(deserialize_with = "id_string")]
    pub preset_subject_id: String,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub custom_weekly_hours: Option<i64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintRow {
    pub subject: String,
    pub class_label: String,
    pub weekly_hours: i64,
}

pub fn resolve_blueprint(presets: &[PresetSubject], overrides: &[SubjectOverride]) -> Vec<BlueprintRow> {
    let by_id: HashMap<&str, &SubjectOverride> = overrides
        .iter()
        .map(|o| (o.preset_subject_id.as_str(), o))
        .collect();

    let mut out = Vec::with_capacity(presets.len());
    for p in presets {
        let ov = by_id.get(p.id.as_str()).copied();
        if ov.and_then(|o| o.is_active) == Some(false) {
            continue;
        }
        let name = ov
            .and_then(|o| o.custom_name.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(p.subject_name.trim());
        let hours = ov
            .and_then(|o| o.custom_weekly_hours)
            .unwrap_or(p.weekly_hours);
        let class_label = p.class_label.trim();
        if name.is_empty() || class_label.is_empty() {
            continue;
        }
        out.push(BlueprintRow {
            subject: name.to_string(),
            class_label: class_label.to_string(),
            weekly_hours: hours,
        });
    }
    out
}

/// One cell of the class x shift selection grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixRow {
    pub course_key: String,
    pub class_label: String,
    pub turno: String,
    #[serde(default)]
    pub quantidade: Option<i64>,
}

pub fn normalize_turno(t: &str) -> String {
    t.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSelection {
    pub class_label: String,
    pub turnos: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseGroup {
    pub course_key: String,
    pub classes: Vec<ClassSelection>,
}

/// Groups matrix rows by course, keeping first-appearance order for courses,
/// classes within a course, and shifts within a class.
pub fn group_matrix(rows: &[MatrixRow]) -> Vec<CourseGroup> {
    let mut groups: Vec<CourseGroup> = Vec::new();
    for row in rows {
        let course_key = row.course_key.trim();
        let class_label = row.class_label.trim();
        let turno = normalize_turno(&row.turno);
        if course_key.is_empty() || class_label.is_empty() || turno.is_empty() {
            continue;
        }
        let gi = match groups.iter().position(|g| g.course_key == course_key) {
            Some(i) => i,
            None => {
                groups.push(CourseGroup {
                    course_key: course_key.to_string(),
                    classes: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[gi];
        let ci = match group.classes.iter().position(|c| c.class_label == class_label) {
            Some(i) => i,
            None => {
                group.classes.push(ClassSelection {
                    class_label: class_label.to_string(),
                    turnos: Vec::new(),
                });
                group.classes.len() - 1
            }
        };
        let sel = &mut group.classes[ci];
        if !sel.turnos.contains(&turno) {
            sel.turnos.push(turno);
        }
    }
    groups
}

pub fn override_key(course_key: &str, class_label: &str, subject: &str) -> String {
    format!("{course_key}{KEY_SEP}{class_label}{KEY_SEP}{subject}")
}

pub fn split_override_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, KEY_SEP);
    let course = parts.next()?;
    let class = parts.next()?;
    let subject = parts.next()?;
    if course.is_empty() || class.is_empty() || subject.is_empty() {
        return None;
    }
    Some((course, class, subject))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassTotal {
    pub class_label: String,
    pub weekly_hours: i64,
}

#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub course_key: String,
    pub classes: Vec<ClassSelection>,
    pub subjects: Vec<BlueprintRow>,
    pub matrix: BTreeMap<String, bool>,
    pub class_totals: Vec<ClassTotal>,
}

/// Builds the install plan for one course group.
///
/// Blueprint rows for classes outside the group's selection are dropped, so an
/// hour override naming such a class never matches anything.
pub fn plan_group(
    group: &CourseGroup,
    blueprint: &[BlueprintRow],
    hour_overrides: &BTreeMap<String, i64>,
) -> GroupPlan {
    let mut subjects = Vec::new();
    let mut matrix = BTreeMap::new();
    let mut totals: Vec<ClassTotal> = group
        .classes
        .iter()
        .map(|c| ClassTotal {
            class_label: c.class_label.clone(),
            weekly_hours: 0,
        })
        .collect();

    for row in blueprint {
        let Some(ci) = group
            .classes
            .iter()
            .position(|c| c.class_label == row.class_label)
        else {
            continue;
        };
        let key = override_key(&group.course_key, &row.class_label, &row.subject);
        let hours = hour_overrides.get(&key).copied().unwrap_or(row.weekly_hours);

        for turno in &group.classes[ci].turnos {
            matrix.insert(
                format!("{}{KEY_SEP}{}{KEY_SEP}{}", row.subject, row.class_label, turno),
                true,
            );
        }
        totals[ci].weekly_hours += hours;
        subjects.push(BlueprintRow {
            subject: row.subject.clone(),
            class_label: row.class_label.clone(),
            weekly_hours: hours,
        });
    }

    GroupPlan {
        course_key: group.course_key.clone(),
        classes: group.classes.clone(),
        subjects,
        matrix,
        class_totals: totals,
    }
}

impl GroupPlan {
    pub fn install_payload(&self, session_id: Option<&str>) -> Value {
        let mut totals = Map::new();
        for t in &self.class_totals {
            totals.insert(t.class_label.clone(), json!(t.weekly_hours));
        }
        json!({
            "presetKey": self.course_key,
            "sessionId": session_id,
            "customData": {
                "classes": self.classes.iter().map(|c| c.class_label.clone()).collect::<Vec<_>>(),
                "turnos": self.classes.iter().map(|c| json!({
                    "classe": c.class_label,
                    "turnos": c.turnos,
                })).collect::<Vec<_>>(),
                "subjects": self.subjects,
                "matrix": self.matrix,
                "classTotals": Value::Object(totals),
            }
        })
    }

    pub fn class_totals_json(&self) -> Value {
        let mut out = Map::new();
        for t in &self.class_totals {
            out.insert(t.class_label.clone(), json!(t.weekly_hours));
        }
        Value::Object(out)
    }
}

/// Hex SHA-256 of the payload's serialized form. Object keys serialize sorted.
pub fn payload_fingerprint(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A schedule slot as returned by the slots endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSlot {
    #[serde(alias = "turno")]
    pub turno_id: String,
    #[serde(default, alias = "intervalo")]
    pub is_intervalo: bool,
}

pub fn available_slots(slots: &[ScheduleSlot], turnos: &HashSet<String>) -> i64 {
    slots
        .iter()
        .filter(|s| !s.is_intervalo && turnos.contains(&normalize_turno(&s.turno_id)))
        .count() as i64
}

pub fn selected_turnos(groups: &[CourseGroup]) -> HashSet<String> {
    groups
        .iter()
        .flat_map(|g| g.classes.iter())
        .flat_map(|c| c.turnos.iter().cloned())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityWarning {
    pub course_key: String,
    pub class_label: String,
    pub required: i64,
    pub available: i64,
    pub message: String,
}

pub fn capacity_warnings(plans: &[GroupPlan], available: i64) -> Vec<CapacityWarning> {
    if available <= 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for plan in plans {
        for t in &plan.class_totals {
            if t.weekly_hours > available {
                out.push(CapacityWarning {
                    course_key: plan.course_key.clone(),
                    class_label: t.class_label.clone(),
                    required: t.weekly_hours,
                    available,
                    message: format!("{} ({}/{})", t.class_label, t.weekly_hours, available),
                });
            }
        }
    }
    out
}
