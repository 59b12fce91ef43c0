//! Embedded schema statements for the Postgres repository.
//!
//! Every statement is idempotent (`IF NOT EXISTS`) so the migration runner
//! can re-apply the set safely.

/// All schema statements, in application order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        r#"
        CREATE TABLE IF NOT EXISTS grading_configs (
            id UUID PRIMARY KEY,
            assignment_id VARCHAR(255) NOT NULL,
            template_name VARCHAR(100) NOT NULL,
            languages JSONB NOT NULL DEFAULT '[]',
            criteria JSONB NOT NULL,
            setup JSONB,
            feedback JSONB NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL DEFAULT 1,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_grading_configs_active
        ON grading_configs (assignment_id)
        WHERE is_active
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS submissions (
            id UUID PRIMARY KEY,
            assignment_id VARCHAR(255) NOT NULL,
            user_id VARCHAR(255) NOT NULL,
            username VARCHAR(255) NOT NULL,
            language VARCHAR(50),
            files JSONB NOT NULL,
            status VARCHAR(20) NOT NULL DEFAULT 'pending',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_submissions_assignment
        ON submissions (assignment_id, created_at)
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_submissions_status
        ON submissions (status)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS submission_results (
            submission_id UUID PRIMARY KEY REFERENCES submissions(id) ON DELETE CASCADE,
            result_tree JSONB,
            focus JSONB,
            feedback TEXT,
            feedback_degraded BOOLEAN NOT NULL DEFAULT FALSE,
            pipeline_execution JSONB NOT NULL,
            final_score DOUBLE PRECISION NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ]
}
