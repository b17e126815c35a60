// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rel query templates consumed by the remote rule system. The templates are
//! opaque to the workflow manager; it only splices data into them and ships
//! them as transaction payloads.

use crate::model::{AzureContainerParams, Export, FileType, Source};
use crate::sources;
use itertools::Itertools;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

pub const IMPORT_CONFIG_REL: &str = "import_config";
pub const MISSED_RESOURCES_REL: &str = "missing_resources_json";
pub const WORKFLOW_JSON_REL: &str = "workflow_json";
pub const BATCH_CONFIG_REL: &str = "batch:config";
pub const DECLARED_DATE_PARTITIONED_SOURCE_REL: &str = "declared_date_partitioned_source:json";

pub const DISABLE_IVM: &str = "def insert:relconfig:disable_ivm = true";

pub const DELETE_REFRESHED_SOURCES_DATA: &str = r#"
    def delete:source_catalog(r, p_i, data...) {
        resources_data_to_delete(r, p_i) and
        source_catalog(r, p_i, data...)
    }
    def delete:source_catalog[r] = source_catalog[r], resources_data_to_delete(r)
    def delete:simple_source_catalog[r] = simple_source_catalog[r], resources_data_to_delete(r)

    def delete:declared_sources_to_delete = declared_sources_to_delete
    def delete:resources_data_to_delete = resources_data_to_delete
"#;

/// A query together with its named string inputs, shipped as one transaction.
#[derive(Debug, Clone, Default)]
pub struct QueryWithInputs {
    pub query: String,
    pub inputs: HashMap<String, String>,
}

impl QueryWithInputs {
    pub fn query_only(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            inputs: HashMap::new(),
        }
    }
}

impl From<String> for QueryWithInputs {
    fn from(query: String) -> Self {
        Self::query_only(query)
    }
}

pub fn load_json(relation: &str, data: &str) -> QueryWithInputs {
    QueryWithInputs {
        query: format!("def config:data = data\ndef insert:{relation} = load_json[config]"),
        inputs: HashMap::from([("data".to_string(), data.to_string())]),
    }
}

pub fn install_models(models: &[(String, String)]) -> QueryWithInputs {
    let mut query = String::new();
    let mut inputs = HashMap::new();
    for (index, (name, content)) in models.iter().enumerate() {
        let input_name = format!("model_input_{index}");
        query.push_str(&format!(
            "def delete:rel:catalog:model[\"{name}\"] = rel:catalog:model[\"{name}\"]\n\
             def insert:rel:catalog:model[\"{name}\"] = {input_name}\n"
        ));
        inputs.insert(input_name, content.clone());
    }
    QueryWithInputs { query, inputs }
}

pub fn init_workflow_steps(batch_config_name: &str) -> String {
    format!(
        r#"
    def delete:batch_workflow_step:state_value(s, v) {{
        batch_workflow_step:workflow[s] . batch_workflow:name[:{batch_config_name}] and
        batch_workflow_step:state_value(s, v)
    }}
    def delete:batch_workflow_step:execution_time_value(s, v) {{
        batch_workflow_step:workflow[s] . batch_workflow:name[:{batch_config_name}] and
        batch_workflow_step:execution_time_value(s, v)
    }}
    def insert:batch_workflow_step:state_value(s, v) {{
        batch_workflow_step:workflow[s] . batch_workflow:name[:{batch_config_name}] and
        v = "INIT"
    }}
    def insert:batch_workflow_step:execution_time_value(s, v) {{
        batch_workflow_step:workflow[s] . batch_workflow:name[:{batch_config_name}] and
        v = 0.0
    }}
    "#
    )
}

pub fn update_step_state(idt: &Uuid, state: &str) -> String {
    format!(
        r#"
    def insert:batch_workflow_step:state_value(s in BatchWorkflowStep, v) {{
        s = uint128_hash_value_convert[parse_uuid["{idt}"]] and
        v = "{state}"
    }}
    "#
    )
}

pub fn update_execution_time(idt: &Uuid, execution_time_secs: f64) -> String {
    format!(
        r#"
    def insert:batch_workflow_step:execution_time_value(s in BatchWorkflowStep, v) {{
        s = uint128_hash_value_convert[parse_uuid["{idt}"]] and
        v = {execution_time_secs}
    }}
    "#
    )
}

pub fn update_workflow_idt(batch_config_name: &str, workflow_id: &str) -> String {
    format!(
        r#"
    def insert:batch_workflow:idt_value(w, v) {{
        batch_workflow:name[w] = :{batch_config_name} and
        v = "{workflow_id}"
    }}
    "#
    )
}

pub fn workflow_idt(batch_config_name: &str) -> String {
    format!(
        r#"
    def output(v) {{
        batch_workflow:name[w] = :{batch_config_name} and
        batch_workflow:idt_value(w, v)
        from w
    }}
    "#
    )
}

pub fn populate_source_configs(sources: &[Source]) -> String {
    let source_config_csv = sources.iter().map(Source::to_paths_csv).join("\n");
    let data_formats_csv = sources.iter().map(Source::to_formats_csv).join("\n");
    let container_types_csv = sources.iter().map(Source::to_container_type_csv).join("\n");

    let simple = sources
        .iter()
        .filter(|s| !s.is_chunk_partitioned && !s.is_date_partitioned)
        .map(|s| s.relation.as_str());
    let chunk_partitioned = sources
        .iter()
        .filter(|s| s.is_chunk_partitioned)
        .map(|s| s.relation.as_str());
    let date_partitioned = sources
        .iter()
        .filter(|s| s.is_date_partitioned)
        .map(|s| s.relation.as_str());

    format!(
        r#"
        def delete:source_declares_resource(r, c, p) {{
            declared_sources_to_delete(r, p) and
            source_declares_resource(r, c, p)
        }}

        def resource_config[:data] = """{source_config_csv}"""
        def resource_config[:syntax, :header] = (1, :Relation); (2, :Container); (3, :Path)
        def source_config_csv = load_csv[resource_config]
        def insert:source_declares_resource(r, c, p) =
            exists(i :
                source_config_csv(:Relation, i, r) and
                source_config_csv(:Container, i, c) and
                source_config_csv(:Path, i, p)
            )

        def input_format_config[:data] = """{data_formats_csv}"""
        def input_format_config[:syntax, :header] = (1, :Relation); (2, :InputFormatCode)
        def input_format_config_csv = load_csv[input_format_config]
        def insert:source_has_input_format(r, f) =
            exists(i :
                input_format_config_csv(:Relation, i, r) and
                input_format_config_csv(:InputFormatCode, i, f)
            )

        def container_type_config[:data] = """{container_types_csv}"""
        def container_type_config[:syntax, :header] = (1, :Relation); (2, :ContainerType)
        def container_type_config_csv = load_csv[container_type_config]
        def insert:source_has_container_type(r, t) =
            exists(i :
                container_type_config_csv(:Relation, i, r) and
                container_type_config_csv(:ContainerType, i, t)
            )

        {simple_relations}
        {chunk_relations}
        {date_relations}
    "#,
        simple_relations = literal_relation_insert("simple_source_relation", simple),
        chunk_relations = literal_relation_insert("chunk_partitioned_source_relation", chunk_partitioned),
        date_relations = literal_relation_insert("date_partitioned_source_relation", date_partitioned),
    )
}

fn literal_relation_insert<'a>(
    relation: &str,
    values: impl Iterator<Item = &'a str>,
) -> String {
    let literals = values.map(|v| format!("\"{v}\"")).join(" ; ");
    if literals.is_empty() {
        String::new()
    } else {
        format!("def insert:{relation} = {{ {literals} }}")
    }
}

/// Combines the force-reimport flags with the expired partitions computed by
/// the resolver into the invalidation set the next LoadData step consumes.
pub fn discover_reimport_sources(
    sources: &[Source],
    expired: &[(String, String)],
    force_reimport: bool,
    force_reimport_not_chunk_partitioned: bool,
) -> String {
    let declared_csv = sources
        .iter()
        .map(Source::to_chunk_partitioned_paths_csv)
        .join("\n");
    let expired_csv = expired
        .iter()
        .map(|(relation, path)| format!("{relation},{path}"))
        .join("\n");
    format!(
        r#"
        def force_reimport = {force_reimport}
        def force_reimport_not_chunk_partitioned = {force_reimport_not_chunk_partitioned}

        def resource_config = new_source_config
        def resource_config[:data] = """{declared_csv}"""
        def new_source_config_csv = load_csv[resource_config]

        def expired_resource_config = expired_source_config
        def expired_resource_config[:data] = """{expired_csv}"""
        def expired_source_config_csv = load_csv[expired_resource_config]

        def insert:declared_sources_to_delete = resource_to_invalidate
        def insert:declared_sources_to_delete(rel, path) = part_resource_to_invalidate(rel, _, path)

        def insert:resources_data_to_delete = resources_to_delete
    "#
    )
}

/// Rel-format rendering of `YYYYMMDD`.
const RAI_DATE_FORMAT: &str = "YYYYmmdd";

pub fn snapshot_expiration_date(snapshot_binding: &str) -> String {
    format!(
        r#"
    def output(valid_until) {{
        batch_source:relation(cfg_src, "{snapshot_binding}") and
        batch_source:snapshot_validity_days(cfg_src, validity_days) and
        source:relname(src, :{snapshot_binding}) and
        snapshot_date = source:spans[src] and
        valid_until = format_date[snapshot_date + Day[validity_days], "{RAI_DATE_FORMAT}"]
        from cfg_src, src, snapshot_date, validity_days
    }}
    "#
    )
}

pub fn output_json(relation: &str) -> String {
    format!("def output = json_string[{relation}]")
}

pub fn materialize(relations: &[String]) -> String {
    relations
        .iter()
        .map(|relation| format!("def output:{relation} = count[{relation}]\n"))
        .collect()
}

pub fn local_load_simple(relation: &str, file_type: FileType, data: String) -> QueryWithInputs {
    let raw_data_rel = format!("{relation}_data");
    let query = format!(
        "def {IMPORT_CONFIG_REL}:{relation}:data = {raw_data_rel}\n{}",
        simple_insert(relation, file_type)
    );
    QueryWithInputs {
        query,
        inputs: HashMap::from([(raw_data_rel, data)]),
    }
}

pub fn azure_load_simple(
    relation: &str,
    file_type: FileType,
    uri: &str,
    params: &AzureContainerParams,
) -> String {
    format!(
        "def {IMPORT_CONFIG_REL}:{relation}:integration:provider = \"azure\"\n\
         def {IMPORT_CONFIG_REL}:{relation}:integration:credentials:azure_sas_token = raw\"{sas}\"\n\
         def {IMPORT_CONFIG_REL}:{relation}:path = \"{uri}\"\n\
         {insert}",
        sas = params.sas,
        insert = simple_insert(relation, file_type)
    )
}

pub fn local_load_multipart(
    relation: &str,
    file_type: FileType,
    parts: &[(i64, String)],
) -> QueryWithInputs {
    let raw_data_rel = format!("{relation}_data");
    let mut inputs = HashMap::new();
    let mut raw_text = String::new();
    let mut part_indexes = String::new();
    for (index, data) in parts {
        let input_name = format!("{raw_data_rel}_{index}");
        raw_text.push_str(&format!("def {raw_data_rel}[{index}] = {input_name}\n"));
        part_indexes.push_str(&format!("{index}\n"));
        inputs.insert(input_name, data.clone());
    }
    let query = format!(
        "{part_index}\n{raw_text}\n{config}\n{insert}",
        part_index = part_index_relation(&part_indexes),
        config = multipart_load_config(
            relation,
            file_type,
            &format!("def data = {raw_data_rel}[i]")
        ),
        insert = multipart_insert(relation, file_type),
    );
    QueryWithInputs { query, inputs }
}

pub fn azure_load_multipart(
    relation: &str,
    file_type: FileType,
    parts: &[(i64, String)],
    params: &AzureContainerParams,
) -> String {
    let path_rel = format!("{relation}_path");
    let mut part_indexes = String::new();
    let mut part_uri_map = String::new();
    for (index, uri) in parts {
        part_indexes.push_str(&format!("{index}\n"));
        part_uri_map.push_str(&format!("{index},\"{uri}\"\n"));
    }
    let integration = format!(
        "def integration:provider = \"azure\"\n\
         def integration:credentials:azure_sas_token = raw\"{sas}\"\n\
         def path = {path_rel}[i]",
        sas = params.sas
    );
    format!(
        "{part_index}\n{uri_map}\n{config}\n{insert}",
        part_index = part_index_relation(&part_indexes),
        uri_map = part_uri_relation(&path_rel, &part_uri_map),
        config = multipart_load_config(relation, file_type, &integration),
        insert = multipart_insert(relation, file_type),
    )
}

fn simple_insert(relation: &str, file_type: FileType) -> String {
    format!(
        "def insert:simple_source_catalog:{relation} = {load}[{IMPORT_CONFIG_REL}:{relation}]",
        load = file_type.load_relation()
    )
}

fn multipart_insert(relation: &str, file_type: FileType) -> String {
    format!(
        "def insert:source_catalog:{relation}[i] = {load}[load_{relation}_config[i]]",
        load = file_type.load_relation()
    )
}

fn multipart_load_config(relation: &str, file_type: FileType, integration: &str) -> String {
    let schema = if file_type == FileType::Csv {
        format!(
            "def schema = {IMPORT_CONFIG_REL}:{relation}:schema\n    \
             def syntax:header = {IMPORT_CONFIG_REL}:{relation}:syntax:header"
        )
    } else {
        String::new()
    };
    format!(
        "bound {IMPORT_CONFIG_REL}:{relation}:schema\n\
         bound {IMPORT_CONFIG_REL}:{relation}:syntax:header\n\
         module load_{relation}_config[i in part_indexes]\n    {schema}\n    {integration}\nend"
    )
}

fn part_index_relation(part_indexes: &str) -> String {
    format!(
        "def part_index_config:schema:INDEX = \"int\"\n\
         def part_index_config:data = \"\"\"\nINDEX\n{part_indexes}\"\"\"\n\
         def part_indexes_csv = load_csv[part_index_config]\n\
         def part_indexes = part_indexes_csv:INDEX[_]"
    )
}

fn part_uri_relation(path_rel: &str, part_uri_map: &str) -> String {
    format!(
        "def part_uri_map_config:schema:INDEX = \"int\"\n\
         def part_uri_map_config:schema:URI = \"string\"\n\
         def part_uri_map_config:data = \"\"\"\nINDEX,URI\n{part_uri_map}\"\"\"\n\
         def part_uri_map_csv = load_csv[part_uri_map_config]\n\
         def {path_rel}(i, u) {{ part_uri_map_csv:INDEX(row, i) and part_uri_map_csv:URI(row, u) from row }}"
    )
}

pub fn export_relations_local(exports: &[&Export]) -> String {
    let mut query = String::new();
    for export in exports {
        if export.file_type != FileType::Csv {
            warn!("Unsupported export type: {}", export.file_type);
            continue;
        }
        if export.meta_key.is_empty() {
            query.push_str(&format!(
                "def _export_csv_config:{relation} = export_config:{relation}\n\
                 def output:{relation} = csv_string[_export_csv_config:{relation}]\n",
                relation = export.relation
            ));
        } else {
            let keys = meta_key_seq(export);
            query.push_str(&format!(
                r#"
    module _export_csv_config
        def {relation}[{keys}] =
            export_config:{relation}[{keys}], export_config:{relation}:meta_key({keys})
    end
    def output:{relation}[{keys}] = csv_string[_export_csv_config:{relation}[{keys}]]
    "#,
                relation = export.relation
            ));
        }
    }
    query
}

pub fn export_relations_azure(
    params: &AzureContainerParams,
    exports: &[&Export],
    end_date: &str,
) -> String {
    let mut query = format!(
        "\n    def _credentials_config:integration:provider = \"azure\"\n    \
         def _credentials_config:integration:credentials:azure_sas_token = raw\"{}\"\n",
        params.sas
    );
    for export in exports {
        if export.file_type != FileType::Csv {
            warn!("Unsupported export type: {}", export.file_type);
            continue;
        }
        let base_path = compose_export_path(params, export, end_date);
        if export.meta_key.is_empty() {
            let export_path = format!("{base_path}/{}.csv", export.relation);
            query.push_str(&format!(
                r#"
    module _export_csv_config
        def {relation} = export_config:{relation}
        def {relation}:path = raw"{export_path}"
        def {relation} = _credentials_config
    end
    def export:{relation} = export_csv[_export_csv_config:{relation}]
    "#,
                relation = export.relation
            ));
        } else {
            let keys = meta_key_seq(export);
            let postfix = meta_key_postfix(export);
            let export_path = format!("{base_path}/{}_{postfix}.csv", export.relation);
            query.push_str(&format!(
                r#"
    module _export_csv_config
        module {relation}
            def meta_key({keys}) = export_config:{relation}:meta_key({keys})
            def path[{keys}] = meta_key({keys}), "{export_path}"

            def config[keys...] = meta_key(keys...), {{
                :path, path[keys...] ;
                export_config:{relation}[keys...] ;
                _credentials_config
            }}
        end
    end
    def export:{relation}[{keys}] = export_csv[_export_csv_config:{relation}:config[{keys}]],
        _export_csv_config:{relation}:meta_key[{keys}]
    "#,
                relation = export.relation
            ));
        }
    }
    query
}

fn compose_export_path(params: &AzureContainerParams, export: &Export, end_date: &str) -> String {
    let date_path = sources::date_path(end_date, export.offset_by_number_of_days)
        .unwrap_or_else(|_| format!("{}{end_date}", sources::DATE_PREFIX));
    let account_url = params.account_url();
    if export.meta_key.is_empty() {
        format!(
            "{account_url}/{}/{}/{}/{date_path}",
            params.container, params.data_path, export.relative_path
        )
    } else {
        format!(
            "{account_url}/{}/{}/{}_{}/{date_path}",
            params.container,
            params.data_path,
            export.relative_path,
            meta_key_postfix(export)
        )
    }
}

fn meta_key_seq(export: &Export) -> String {
    (0..export.meta_key.len())
        .map(|i| format!("_v{i}"))
        .join(", ")
}

fn meta_key_postfix(export: &Export) -> String {
    (0..export.meta_key.len())
        .map(|i| format!("%(_v{i})"))
        .join("_")
}

pub fn build_relation_path(relation: &str, keys: &[&str]) -> String {
    if keys.is_empty() {
        relation.to_string()
    } else {
        format!("{relation}:{}", keys.join(":"))
    }
}
