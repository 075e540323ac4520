use indoc::indoc;

/// Schema placeholder replaced by the escaped schema name before execution
pub(crate) const SCHEMA_PLACEHOLDER: &str = ":QUEUE_SCHEMA";

/// Schema revisions in order, revision `n` is `REVISIONS[n - 1]`.
///
/// Append only: an applied revision is never edited.
pub(crate) const REVISIONS: &[&[&str]] = &[
    // 1: pending and reserved jobs
    &[
        indoc! {r#"
            create table :QUEUE_SCHEMA.jobs (
                id bigserial primary key,
                queue text not null default 'default',
                payload text not null,
                attempts int not null default 0 check (attempts >= 0),
                reserved_at timestamptz,
                available_at timestamptz not null default now(),
                created_at timestamptz not null default now()
            );
        "#},
        indoc! {r#"
            create index jobs_queue_available_at_idx
                on :QUEUE_SCHEMA.jobs (queue, available_at, id)
                where reserved_at is null;
        "#},
    ],
    // 2: dead letters
    &[indoc! {r#"
        create table :QUEUE_SCHEMA.failed_jobs (
            id bigserial primary key,
            job_id bigint not null,
            queue text not null,
            payload text not null,
            exception text not null,
            attempts int not null default 0,
            failed_at timestamptz not null default now()
        );
    "#}],
    // 3: stalled job scans
    &[indoc! {r#"
        create index jobs_reserved_at_idx
            on :QUEUE_SCHEMA.jobs (reserved_at)
            where reserved_at is not null;
    "#}],
];
