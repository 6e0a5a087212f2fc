mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    error_code, find_by, request, request_ok, spawn_sidecar, temp_dir, write_file,
};

fn save_people_template(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    request_ok(
        stdin,
        reader,
        "tpl",
        "templates.save",
        json!({
            "template": {
                "name": "people",
                "verboseName": "People",
                "targetKind": "person",
                "separator": ",",
                "hasHeaderRow": true,
                "fields": [
                    { "index": 0, "fieldType": "unique_reference" },
                    { "index": 1, "fieldType": "last_name" },
                    { "index": 2, "fieldType": "first_name" },
                    { "index": 3, "fieldType": "date_of_birth" },
                    { "index": 4, "fieldType": "sex" },
                    { "index": 5, "fieldType": "is_active" },
                    { "index": 6, "fieldType": "email" }
                ]
            }
        }),
    );
}

#[test]
fn row_failure_does_not_stop_the_import() {
    let workspace = temp_dir("csvimportd-persons-rows");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    save_people_template(&mut stdin, &mut reader);

    let csv = write_file(
        &workspace,
        "people.csv",
        "ref,last,first,dob,sex,active,email\n\
         100,Doe,Jane,01.02.2010,w,+,jane@example.org\n\
         101,,Max,03.04.2011,m,+,\n\
         102,Roe,Rick,31.12.2009,m,Ja,\n",
    );
    let run = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.run",
        json!({ "templateName": "people", "inPath": csv.to_string_lossy() }),
    );
    assert_eq!(run["anyFailed"], json!(true));
    let outcome = &run["outcome"];
    assert_eq!(outcome["state"], json!("succeeded_with_errors"));
    assert_eq!(outcome["totalRows"], json!(3));
    assert_eq!(outcome["processedRows"], json!(3));
    assert_eq!(outcome["created"], json!(2));
    let errors = outcome["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert!(
        errors[0].as_str().unwrap_or("").starts_with("Row 2 (line 3)"),
        "unexpected error: {}",
        errors[0]
    );

    let texts: Vec<&str> = run["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .filter_map(|m| m["text"].as_str())
        .collect();
    assert!(texts.contains(&"2 persons were newly created."));
    assert!(texts.contains(&"Some persons failed to be imported."));

    let persons = request_ok(&mut stdin, &mut reader, "3", "persons.list", json!({}));
    let jane = find_by(&persons["persons"], "importRef", "100").expect("jane");
    assert_eq!(jane["dateOfBirth"], json!("2010-02-01"));
    assert_eq!(jane["sex"], json!("f"));
    assert_eq!(jane["email"], json!("jane@example.org"));
    assert!(find_by(&persons["persons"], "importRef", "102").is_some());
    assert!(find_by(&persons["persons"], "importRef", "101").is_none());

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn inactive_rows_deactivate_existing_persons() {
    let workspace = temp_dir("csvimportd-persons-inactive");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    save_people_template(&mut stdin, &mut reader);

    let first = write_file(
        &workspace,
        "first.csv",
        "ref,last,first,dob,sex,active,email\n\
         200,Alpha,Ann,,,+,\n\
         201,Beta,Ben,,,+,\n",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.run",
        json!({ "templateName": "people", "inPath": first.to_string_lossy() }),
    );

    // Ben leaves, Ann is updated, a brand new inactive row is ignored.
    let second = write_file(
        &workspace,
        "second.csv",
        "ref,last,first,dob,sex,active,email\n\
         200,Alpha,Anna,,,+,\n\
         201,Beta,Ben,,,-,\n\
         299,Gamma,Gus,,,Nein,\n",
    );
    let run = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "import.run",
        json!({ "templateName": "people", "inPath": second.to_string_lossy() }),
    );
    let outcome = &run["outcome"];
    assert_eq!(outcome["state"], json!("all_succeeded"));
    assert_eq!(outcome["created"], json!(0));
    assert_eq!(outcome["updated"], json!(1));
    assert_eq!(outcome["inactiveRows"], json!(2));
    assert_eq!(outcome["deactivated"], json!(1));
    let texts: Vec<&str> = run["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .filter_map(|m| m["text"].as_str())
        .collect();
    assert!(texts.contains(&"1 existing persons were deactivated."));
    assert!(texts.contains(&"All persons were imported successfully."));

    let active = request_ok(&mut stdin, &mut reader, "4", "persons.list", json!({}));
    assert_eq!(active["persons"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(active["persons"][0]["firstName"], json!("Anna"));

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "persons.list",
        json!({ "includeInactive": true }),
    );
    let ben = find_by(&all["persons"], "importRef", "201").expect("ben");
    assert_eq!(ben["isActive"], json!(false));
    assert!(find_by(&all["persons"], "importRef", "299").is_none());

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn jobs_record_every_run() {
    let workspace = temp_dir("csvimportd-persons-jobs");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    save_people_template(&mut stdin, &mut reader);

    let csv = write_file(&workspace, "one.csv", "ref,last,first,dob,sex,active,email\n");
    let run = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.run",
        json!({ "templateName": "people", "inPath": csv.to_string_lossy(), "schoolTerm": "2024/25" }),
    );
    assert_eq!(run["outcome"]["totalRows"], json!(0));
    let job_id = run["jobId"].as_str().expect("job id").to_string();

    // Wrong column count is fatal for the whole file.
    let broken = write_file(
        &workspace,
        "broken.csv",
        "ref,last,first,dob,sex,active,email\n300,Delta,Dora\n",
    );
    let run = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "import.run",
        json!({ "templateName": "people", "inPath": broken.to_string_lossy() }),
    );
    assert_eq!(run["outcome"]["state"], json!("fatal_parse_failure"));
    assert_eq!(run["outcome"]["processedRows"], json!(0));
    let persons = request_ok(&mut stdin, &mut reader, "4", "persons.list", json!({}));
    assert_eq!(persons["persons"], json!([]));

    let job = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "import.jobs.get",
        json!({ "jobId": job_id }),
    );
    assert_eq!(job["job"]["schoolTerm"], json!("2024/25"));
    assert_eq!(job["job"]["template"], json!("people"));
    assert_eq!(job["job"]["dataSha256"].as_str().map(str::len), Some(64));
    assert!(job["job"]["finishedAt"].is_string());

    let jobs = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "import.jobs.list",
        json!({ "templateName": "people" }),
    );
    assert_eq!(jobs["jobs"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(
        jobs["jobs"][0]["result"]["state"],
        json!("fatal_parse_failure")
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "import.jobs.get",
        json!({ "jobId": "missing" }),
    );
    assert_eq!(error_code(&resp), Some("not_found"));

    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "import.run",
        json!({ "templateName": "nope", "inPath": csv.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("not_found"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn rejected_runs_are_recorded_on_the_job() {
    let workspace = temp_dir("csvimportd-persons-rejected");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "templates.save",
        json!({
            "template": {
                "name": "pupils",
                "verboseName": "Pupils",
                "targetKind": "person",
                "baseGroup": "all-pupils",
                "fields": [
                    { "index": 0, "fieldType": "unique_reference" },
                    { "index": 1, "fieldType": "last_name" },
                    { "index": 2, "fieldType": "first_name" }
                ]
            }
        }),
    );
    let csv = write_file(&workspace, "pupils.csv", "ref,last,first\n1,Doe,Jane\n");

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "import.run",
        json!({ "templateName": "pupils", "inPath": csv.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("config_invalid"));

    let jobs = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "import.jobs.list",
        json!({ "templateName": "pupils" }),
    );
    assert_eq!(jobs["jobs"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(jobs["jobs"][0]["result"]["state"], json!("rejected"));
    assert!(jobs["jobs"][0]["finishedAt"].is_string());

    let persons = request_ok(&mut stdin, &mut reader, "5", "persons.list", json!({}));
    assert_eq!(persons["persons"], json!([]));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
