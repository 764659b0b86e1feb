use super::{Entity, SqlType};

use SqlType::{Date, Integer, Numeric, Varchar};

// OMOP CDM v5.4 standardized vocabulary tables. Names of constraints and
// indexes follow the official DDL so a schema deployed by other tooling is
// dropped and rebuilt in place.
pub(super) fn entities() -> Vec<Entity> {
    vec![
        concept(),
        vocabulary(),
        domain(),
        concept_class(),
        concept_relationship(),
        relationship(),
        concept_synonym(),
        concept_ancestor(),
        source_to_concept_map(),
        drug_strength(),
    ]
}

fn concept() -> Entity {
    Entity::new("concept")
        .column("concept_id", Integer)
        .column("concept_name", Varchar(255))
        .column("domain_id", Varchar(20))
        .column("vocabulary_id", Varchar(20))
        .column("concept_class_id", Varchar(20))
        .nullable_column("standard_concept", Varchar(1))
        .column("concept_code", Varchar(50))
        .column("valid_start_date", Date)
        .column("valid_end_date", Date)
        .nullable_column("invalid_reason", Varchar(1))
        .primary_key("xpk_concept", &["concept_id"])
        .foreign_key("fpk_concept_domain_id", &["domain_id"], "domain", &["domain_id"])
        .foreign_key(
            "fpk_concept_vocabulary_id",
            &["vocabulary_id"],
            "vocabulary",
            &["vocabulary_id"],
        )
        .foreign_key(
            "fpk_concept_concept_class_id",
            &["concept_class_id"],
            "concept_class",
            &["concept_class_id"],
        )
        .index("idx_concept_concept_id", &["concept_id"])
        .index("idx_concept_code", &["concept_code"])
        .index("idx_concept_vocabluary_id", &["vocabulary_id"])
        .index("idx_concept_domain_id", &["domain_id"])
        .index("idx_concept_class_id", &["concept_class_id"])
}

fn vocabulary() -> Entity {
    Entity::new("vocabulary")
        .column("vocabulary_id", Varchar(20))
        .column("vocabulary_name", Varchar(255))
        .nullable_column("vocabulary_reference", Varchar(255))
        .nullable_column("vocabulary_version", Varchar(255))
        .column("vocabulary_concept_id", Integer)
        .primary_key("xpk_vocabulary", &["vocabulary_id"])
        .foreign_key(
            "fpk_vocabulary_vocabulary_concept_id",
            &["vocabulary_concept_id"],
            "concept",
            &["concept_id"],
        )
        .index("idx_vocabulary_vocabulary_id", &["vocabulary_id"])
}

fn domain() -> Entity {
    Entity::new("domain")
        .column("domain_id", Varchar(20))
        .column("domain_name", Varchar(255))
        .column("domain_concept_id", Integer)
        .primary_key("xpk_domain", &["domain_id"])
        .foreign_key(
            "fpk_domain_domain_concept_id",
            &["domain_concept_id"],
            "concept",
            &["concept_id"],
        )
        .index("idx_domain_domain_id", &["domain_id"])
}

fn concept_class() -> Entity {
    Entity::new("concept_class")
        .column("concept_class_id", Varchar(20))
        .column("concept_class_name", Varchar(255))
        .column("concept_class_concept_id", Integer)
        .primary_key("xpk_concept_class", &["concept_class_id"])
        .foreign_key(
            "fpk_concept_class_concept_class_concept_id",
            &["concept_class_concept_id"],
            "concept",
            &["concept_id"],
        )
        .index("idx_concept_class_class_id", &["concept_class_id"])
}

fn concept_relationship() -> Entity {
    Entity::new("concept_relationship")
        .column("concept_id_1", Integer)
        .column("concept_id_2", Integer)
        .column("relationship_id", Varchar(20))
        .column("valid_start_date", Date)
        .column("valid_end_date", Date)
        .nullable_column("invalid_reason", Varchar(1))
        .foreign_key(
            "fpk_concept_relationship_concept_id_1",
            &["concept_id_1"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_concept_relationship_concept_id_2",
            &["concept_id_2"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_concept_relationship_relationship_id",
            &["relationship_id"],
            "relationship",
            &["relationship_id"],
        )
        .index("idx_concept_relationship_id_1", &["concept_id_1"])
        .index("idx_concept_relationship_id_2", &["concept_id_2"])
        .index("idx_concept_relationship_id_3", &["relationship_id"])
}

fn relationship() -> Entity {
    Entity::new("relationship")
        .column("relationship_id", Varchar(20))
        .column("relationship_name", Varchar(255))
        .column("is_hierarchical", Varchar(1))
        .column("defines_ancestry", Varchar(1))
        .column("reverse_relationship_id", Varchar(20))
        .column("relationship_concept_id", Integer)
        .primary_key("xpk_relationship", &["relationship_id"])
        .foreign_key(
            "fpk_relationship_relationship_concept_id",
            &["relationship_concept_id"],
            "concept",
            &["concept_id"],
        )
        .index("idx_relationship_rel_id", &["relationship_id"])
}

fn concept_synonym() -> Entity {
    Entity::new("concept_synonym")
        .column("concept_id", Integer)
        .column("concept_synonym_name", Varchar(1000))
        .column("language_concept_id", Integer)
        .foreign_key(
            "fpk_concept_synonym_concept_id",
            &["concept_id"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_concept_synonym_language_concept_id",
            &["language_concept_id"],
            "concept",
            &["concept_id"],
        )
        .index("idx_concept_synonym_id", &["concept_id"])
}

fn concept_ancestor() -> Entity {
    Entity::new("concept_ancestor")
        .column("ancestor_concept_id", Integer)
        .column("descendant_concept_id", Integer)
        .column("min_levels_of_separation", Integer)
        .column("max_levels_of_separation", Integer)
        .foreign_key(
            "fpk_concept_ancestor_ancestor_concept_id",
            &["ancestor_concept_id"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_concept_ancestor_descendant_concept_id",
            &["descendant_concept_id"],
            "concept",
            &["concept_id"],
        )
        .index("idx_concept_ancestor_id_1", &["ancestor_concept_id"])
        .index("idx_concept_ancestor_id_2", &["descendant_concept_id"])
}

fn source_to_concept_map() -> Entity {
    Entity::new("source_to_concept_map")
        .column("source_code", Varchar(50))
        .column("source_concept_id", Integer)
        .column("source_vocabulary_id", Varchar(20))
        .nullable_column("source_code_description", Varchar(255))
        .column("target_concept_id", Integer)
        .column("target_vocabulary_id", Varchar(20))
        .column("valid_start_date", Date)
        .column("valid_end_date", Date)
        .nullable_column("invalid_reason", Varchar(1))
        .foreign_key(
            "fpk_source_to_concept_map_source_concept_id",
            &["source_concept_id"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_source_to_concept_map_target_concept_id",
            &["target_concept_id"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_source_to_concept_map_target_vocabulary_id",
            &["target_vocabulary_id"],
            "vocabulary",
            &["vocabulary_id"],
        )
        .index("idx_source_to_concept_map_3", &["target_concept_id"])
        .index("idx_source_to_concept_map_1", &["source_vocabulary_id"])
        .index("idx_source_to_concept_map_2", &["target_vocabulary_id"])
        .index("idx_source_to_concept_map_c", &["source_code"])
}

fn drug_strength() -> Entity {
    Entity::new("drug_strength")
        .column("drug_concept_id", Integer)
        .column("ingredient_concept_id", Integer)
        .nullable_column("amount_value", Numeric)
        .nullable_column("amount_unit_concept_id", Integer)
        .nullable_column("numerator_value", Numeric)
        .nullable_column("numerator_unit_concept_id", Integer)
        .nullable_column("denominator_value", Numeric)
        .nullable_column("denominator_unit_concept_id", Integer)
        .nullable_column("box_size", Integer)
        .column("valid_start_date", Date)
        .column("valid_end_date", Date)
        .nullable_column("invalid_reason", Varchar(1))
        .foreign_key(
            "fpk_drug_strength_drug_concept_id",
            &["drug_concept_id"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_drug_strength_ingredient_concept_id",
            &["ingredient_concept_id"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_drug_strength_amount_unit_concept_id",
            &["amount_unit_concept_id"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_drug_strength_numerator_unit_concept_id",
            &["numerator_unit_concept_id"],
            "concept",
            &["concept_id"],
        )
        .foreign_key(
            "fpk_drug_strength_denominator_unit_concept_id",
            &["denominator_unit_concept_id"],
            "concept",
            &["concept_id"],
        )
        .index("idx_drug_strength_id_1", &["drug_concept_id"])
        .index("idx_drug_strength_id_2", &["ingredient_concept_id"])
}
